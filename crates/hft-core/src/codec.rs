//! Newline-delimited JSON framing for the control plane.
//!
//! Wire format: `<compact JSON object>\n`. A frame is a single line; CR/LF
//! terminators are both accepted on decode.

use crate::error::{HftError, HftResult};

/// Longest control line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 4096;

/// Encode a serializable value as one JSON line.
pub fn encode_line<T: serde::Serialize>(value: &T) -> HftResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one JSON line (terminator optional) into a typed value.
pub fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> HftResult<T> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(HftError::Protocol("empty request".into()));
    }
    if line.len() > MAX_LINE_LEN {
        return Err(HftError::Protocol(format!(
            "line exceeds {MAX_LINE_LEN} bytes"
        )));
    }
    Ok(serde_json::from_str(line)?)
}

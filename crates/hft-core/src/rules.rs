//! Rule-file parsing.
//!
//! One rule per line, comma separated:
//!
//! ```text
//! # listeningPort,destinationIP:destinationPort,viaIP,comment
//! 8080,127.0.0.1:9090,127.0.0.1,test
//! ```
//!
//! The comment is optional and may itself contain commas. Lines whose first
//! non-space character is `#`, and blank lines, are skipped. Loading is
//! all-or-nothing: any bad line or duplicated listening port rejects the
//! whole file and every problem is returned at once.

use crate::error::{HftError, HftResult};
use crate::rule::{parse_endpoint, parse_via, ForwardingRule};
use std::collections::BTreeMap;
use std::path::Path;

/// Read and parse a rule file.
pub fn load_rules(path: &Path) -> HftResult<Vec<ForwardingRule>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HftError::RulesRejected(vec![format!("cannot read {}: {e}", path.display())])
    })?;
    parse_rules(&content)
}

/// Parse rule-file text. Returns [`HftError::RulesRejected`] with one message
/// per problem when anything is wrong.
pub fn parse_rules(content: &str) -> HftResult<Vec<ForwardingRule>> {
    let mut rules = Vec::new();
    let mut errors = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_line(trimmed) {
            Ok(rule) => rules.push(rule),
            Err(reason) => errors.push(format!("line {line_no}: {reason}")),
        }
    }

    let mut seen: BTreeMap<u16, usize> = BTreeMap::new();
    for rule in &rules {
        *seen.entry(rule.listening_port).or_default() += 1;
    }
    let duplicates: Vec<String> = seen
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(port, _)| port.to_string())
        .collect();
    if !duplicates.is_empty() {
        errors.push(format!(
            "duplicated listening ports: {}",
            duplicates.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(rules)
    } else {
        Err(HftError::RulesRejected(errors))
    }
}

fn parse_line(line: &str) -> Result<ForwardingRule, String> {
    let fields: Vec<&str> = line.splitn(4, ',').collect();
    if fields.len() < 3 {
        return Err(format!(
            "expected at least 3 comma-separated fields, found {}",
            fields.len()
        ));
    }

    let port_str = fields[0].trim();
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("invalid listening port '{port_str}'"))?;
    let destination = parse_endpoint(fields[1]).map_err(|e| e.to_string())?;
    let via = parse_via(fields[2]).map_err(|e| e.to_string())?;
    let comment = fields.get(3).map(|c| c.trim()).unwrap_or_default();

    ForwardingRule::new(port, destination, via, comment).map_err(|e| e.to_string())
}

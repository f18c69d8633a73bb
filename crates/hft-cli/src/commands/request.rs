//! `hftctl request`: ask a running proxy for a forwarding port.

use anyhow::{bail, Context, Result};
use hft_core::{decode_line, encode_line, ControlRequest, ControlResponse};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Send one request to the control plane at `control` and print the answer.
/// Fails when the proxy answers with an Error response.
pub async fn run(control: &str, request: &ControlRequest, timeout_secs: u64, json: bool) -> Result<()> {
    let timeout = Duration::from_secs(timeout_secs);
    let response = tokio::time::timeout(timeout, exchange(control, request))
        .await
        .with_context(|| format!("no response from {control} within {timeout_secs}s"))??;

    if json {
        println!("{}", serde_json::to_string(&response)?);
    } else if response.is_success() {
        println!("port {}", response.port);
        println!("{}", response.comment);
    }

    if !response.is_success() {
        bail!("{} (port {})", response.comment, response.port);
    }
    Ok(())
}

async fn exchange(control: &str, request: &ControlRequest) -> Result<ControlResponse> {
    let mut stream = TcpStream::connect(control)
        .await
        .with_context(|| format!("cannot connect to control port {control}"))?;
    debug!(control, ?request, "sending control request");

    stream.write_all(&encode_line(request)?).await?;
    let mut reply = String::new();
    stream
        .read_to_string(&mut reply)
        .await
        .context("failed to read control response")?;

    decode_line(&reply).context("malformed control response")
}

//! hftctl: operator CLI for hftproxy.
//!
//! Validates rule files offline and asks a running proxy for a forwarding
//! port over its control plane.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

/// hftctl: hftproxy operator tool
#[derive(Parser)]
#[command(name = "hftctl", version, about = "Validate rule files and request ports from hftproxy")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a rule file and list its rules or every problem in it
    Check {
        /// Rule file path
        file: PathBuf,
    },

    /// Request a forwarding port from a running proxy
    Request {
        /// Destination IP address
        #[arg(long)]
        target_ip: String,

        /// Destination port
        #[arg(long)]
        target_port: i64,

        /// Local address outbound connections are made from (0.0.0.0 = any)
        #[arg(long, default_value = "0.0.0.0")]
        via_ip: String,

        /// Control-plane address of the proxy
        #[arg(long, default_value = "127.0.0.1:8001")]
        control: String,

        /// Seconds to wait for the response
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("hftctl=debug,hft_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("hftctl=warn")
            .with_target(false)
            .init();
    }

    let result = match cli.command {
        Command::Check { file } => commands::check::run(&file),
        Command::Request {
            target_ip,
            target_port,
            via_ip,
            control,
            timeout,
            json,
        } => {
            let request = hft_core::ControlRequest::new(target_ip, target_port, via_ip);
            commands::request::run(&control, &request, timeout, json).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("hftctl: {e:#}");
        std::process::exit(1);
    }
}

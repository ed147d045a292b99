//! Command-line probe for RTP proxy relays
//!
//! Connects to a relay, waits for the version handshake, prints the
//! discovered capabilities and the reply to one command.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::time::{timeout, Instant};

use rvoip_rtpproxy_client::logging::{parse_log_level, setup_logging, LoggingConfig};
use rvoip_rtpproxy_client::{RtpProxyClient, RtpProxyConfig};

/// Probe an RTP proxy relay over its control protocol
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay spec, e.g. udp:127.0.0.1:22222 or unix:/var/run/rtpproxy.sock
    #[arg(short, long)]
    spec: String,

    /// Command to send once the relay is online
    #[arg(short, long, default_value = "V")]
    command: String,

    /// Skip the version handshake
    #[arg(long)]
    no_version_check: bool,

    /// Seconds to wait for the relay
    #[arg(short, long, default_value = "5")]
    timeout_secs: u64,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?);
    if args.json_logs {
        logging = logging.with_json();
    }
    setup_logging(logging)?;

    let config = RtpProxyConfig::new(&args.spec).with_no_version_check(args.no_version_check);
    let client = RtpProxyClient::new(config)
        .await
        .with_context(|| format!("cannot create client for {}", args.spec))?;
    let wait = Duration::from_secs(args.timeout_secs);
    let deadline = Instant::now() + wait;

    if !client.wait_online(deadline).await {
        client.shutdown();
        bail!("RTP proxy {} did not complete the version handshake", args.spec);
    }
    // Capability discovery gets whatever is left of the budget
    client.wait_capabilities(deadline).await;

    println!("proxy address: {}", client.proxy_address());
    println!("local:         {}", client.is_local());
    if client.caps_done() {
        println!("capabilities:  {:?}", client.capabilities());
    }

    match timeout(wait, client.command(&args.command)).await {
        Ok(Some(reply)) => println!("{}", reply),
        Ok(None) => {
            client.shutdown();
            bail!("command {:?} failed", args.command);
        }
        Err(_) => {
            client.shutdown();
            bail!("no reply to {:?} within {:?}", args.command, wait);
        }
    }

    if let Some(delay) = client.rtpc_delay() {
        println!("round trip:    {:?}", delay);
    }
    client.shutdown();
    Ok(())
}

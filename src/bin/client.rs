//! Facegate Client Binary
//!
//! Command-line client for the binary WebSocket protocol. Sends one request,
//! waits for the matching response and prints it as JSON.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin facegate-client -- ping
//! cargo run --bin facegate-client -- diagnostic
//! cargo run --bin facegate-client -- identify photo.jpg
//! cargo run --bin facegate-client -- --url ws://10.0.0.5:8080/api/v1/core/ws verify a.jpg b.jpg
//! ```

use facegate::protocol::wire::{
    self, DiagnosticResponse, Empty, ErrorResponse, IdentifyRequest, JobResponse, MessageType,
    VerifyRequest,
};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_bytes::ByteBuf;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Parser)]
#[command(name = "facegate-client", version, about = "Facegate WebSocket client")]
struct Args {
    /// WebSocket endpoint
    #[arg(long, default_value = "ws://127.0.0.1:8080/api/v1/core/ws")]
    url: String,

    /// Seconds to wait for the response
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Round-trip a ping
    Ping,
    /// Ask the server for queue and connection counts
    Diagnostic,
    /// Detect faces in one image
    Identify { image: PathBuf },
    /// Compare the faces in two images
    Verify { first: PathBuf, second: PathBuf },
}

fn read_image(path: &Path) -> anyhow::Result<ByteBuf> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(ByteBuf::from(bytes))
}

fn request_frame(command: &Command) -> anyhow::Result<(Vec<u8>, MessageType)> {
    let frame = match command {
        Command::Ping => (
            wire::encode(MessageType::PingRequest, &Empty {})?,
            MessageType::PongResponse,
        ),
        Command::Diagnostic => (
            wire::encode(MessageType::DiagnosticRequest, &Empty {})?,
            MessageType::DiagnosticResponse,
        ),
        Command::Identify { image } => (
            wire::encode(
                MessageType::IdentifyRequest,
                &IdentifyRequest {
                    image: read_image(image)?,
                },
            )?,
            MessageType::IdentifyResponse,
        ),
        Command::Verify { first, second } => (
            wire::encode(
                MessageType::VerifyRequest,
                &VerifyRequest {
                    first_image: read_image(first)?,
                    second_image: read_image(second)?,
                },
            )?,
            MessageType::VerifyResponse,
        ),
    };
    Ok(frame)
}

fn render(frame: &[u8]) -> anyhow::Result<serde_json::Value> {
    let (kind, _) = wire::split_frame(frame)?;
    let value = match kind {
        MessageType::PongResponse => serde_json::json!({ "pong": true }),
        MessageType::DiagnosticResponse => {
            serde_json::to_value(wire::decode::<DiagnosticResponse>(frame)?.1)?
        }
        MessageType::IdentifyResponse | MessageType::VerifyResponse => {
            serde_json::to_value(wire::decode::<JobResponse>(frame)?.1)?
        }
        MessageType::ThrottledResponse => {
            serde_json::to_value(wire::decode::<ErrorResponse>(frame)?.1)?
        }
        other => bail!("unexpected message type {other}"),
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (frame, expected) = request_frame(&args.command)?;

    let (mut stream, _) = tokio_tungstenite::connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    stream.send(Message::Binary(frame)).await?;

    let wait = async {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Binary(data) => {
                    let (kind, _) = wire::split_frame(&data)?;
                    if kind == expected || kind == MessageType::ThrottledResponse {
                        return Ok(data);
                    }
                }
                Message::Close(close) => {
                    let reason = close.map_or_else(String::new, |c| {
                        format!("{} {}", u16::from(c.code), c.reason)
                    });
                    bail!("server closed the connection: {reason}");
                }
                _ => {}
            }
        }
        Err(anyhow!("connection ended without a response"))
    };

    let data = tokio::time::timeout(Duration::from_secs(args.timeout), wait)
        .await
        .map_err(|_| anyhow!("no response within {}s", args.timeout))??;

    println!("{}", serde_json::to_string_pretty(&render(&data)?)?);
    let _ = stream.close(None).await;
    Ok(())
}

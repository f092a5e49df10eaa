//! Echo server and client
//!
//! ```text
//! cargo run --example echo -- server 127.0.0.1:9001
//! cargo run --example echo -- client ws://127.0.0.1:9001/
//! ```
//!
//! Set `RUST_LOG=tidews=trace` to watch frames go by.

use std::time::Duration;

use bytes::BytesMut;
use tidews::{CloseReason, Config, DeflateConfig, Error, Message, WebSocketClient, WebSocketServer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn config() -> Config {
    Config::builder()
        .compression(DeflateConfig::default())
        .idle_timeout(Some(Duration::from_secs(60)))
        .keep_alive_pings(true)
        .build()
}

async fn server(addr: &str) -> tidews::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "listening");

    let server = WebSocketServer::new(config());
    server
        .serve(listener, |mut ws, handshake| async move {
            tracing::info!(path = %handshake.path, "client connected");
            let mut buf = BytesMut::new();
            loop {
                match ws.read(&mut buf).await {
                    Ok(kind) => {
                        ws.set_message_type(kind);
                        if let Err(e) = ws.write(&buf).await {
                            tracing::warn!(error = %e, "echo failed");
                            break;
                        }
                        buf.clear();
                    }
                    Err(Error::ConnectionClosed) => {
                        tracing::info!(reason = ?ws.close_reason(), "client closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "session failed");
                        break;
                    }
                }
            }
        })
        .await
}

async fn client(url: &str) -> tidews::Result<()> {
    let (mut ws, handshake) = WebSocketClient::new(config()).connect_to_url(url).await?;
    tracing::info!(compression = handshake.compression.is_some(), "connected");

    for text in ["Hello, world!", "ping", &"long ".repeat(2000)] {
        ws.send(Message::text(text)).await?;
        let reply = ws.read_message().await?;
        tracing::info!(len = reply.as_bytes().len(), "echoed");
    }

    ws.close(CloseReason::new(CloseReason::NORMAL, "bye")).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.iter().map(String::as_str).collect::<Vec<_>>()[..] {
        ["server", addr] => server(addr).await,
        ["client", url] => client(url).await,
        _ => {
            eprintln!("usage: echo server <addr> | echo client <ws-url>");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "exiting");
        std::process::exit(1);
    }
}

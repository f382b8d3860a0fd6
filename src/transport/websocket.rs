//! WebSocket host server
//!
//! Each accepted socket is one host connection: a reader feeding the
//! dispatcher and a single writer task draining the outbound queue.

use super::dispatcher::Dispatcher;
use super::protocol::HostMessage;
use crate::bridge::Orchestrator;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// WebSocket server carrying the host wire protocol
pub struct WebSocketHost {
    /// Bind address
    addr: String,
    /// Port
    port: u16,
    orchestrator: Orchestrator,
}

impl WebSocketHost {
    pub fn new(addr: String, port: u16, orchestrator: Orchestrator) -> Self {
        Self {
            addr,
            port,
            orchestrator,
        }
    }

    /// Bind and serve until the listener fails
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(format!("{}:{}", self.addr, self.port)).await?;
        info!("WebSocket host listening on ws://{}:{}", self.addr, self.port);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            info!("New host connection from {}", addr);

            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, orchestrator).await {
                    error!("Host connection {} error: {}", addr, e);
                }
            });
        }
    }
}

/// Handle a WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    orchestrator: Orchestrator,
) -> Result<(), Box<dyn std::error::Error>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    info!("WebSocket handshake completed for {}", addr);

    let (write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<HostMessage>();

    let writer_handle = tokio::spawn(async move {
        let mut write = write;
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unserialisable reply {}: {}", message.id(), e);
                    continue;
                }
            };
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let dispatcher = Dispatcher::new(orchestrator, outbound_tx);

    // Handle incoming messages
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatcher.handle_text(&text),
            Ok(Message::Binary(data)) => {
                debug!("Ignoring binary frame from {} ({} bytes)", addr, data.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error from {}: {}", addr, e);
                break;
            }
        }
    }

    drop(dispatcher);
    writer_handle.abort();
    info!("Host connection {} closed", addr);
    Ok(())
}

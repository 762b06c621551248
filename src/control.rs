// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local control socket for external UIs.
//!
//! Newline-delimited JSON frames over a Unix domain socket at
//! `<workspace>/agentd.sock`.  Each connection receives an `init` frame and
//! the live event stream; requests are decoded into [`GatewayRequest`] and
//! handed to the gateway.  This is the thinnest possible marshaling — the
//! protocol itself lives in `agentd-gateway`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use agentd_gateway::{Gateway, GatewayEvent, GatewayRequest};

pub fn socket_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join("agentd.sock")
}

/// Bind the control socket and serve connections until the task is dropped.
pub async fn serve(gateway: Arc<Gateway>, path: PathBuf) -> anyhow::Result<()> {
    // A stale socket from a previous run blocks bind.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!(socket = %path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(gateway, stream).await {
                debug!(error = %e, "observer connection ended");
            }
        });
    }
}

async fn serve_connection(gateway: Arc<Gateway>, stream: UnixStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    write_frame(&mut write_half, &gateway.init_frame()).await?;

    let mut events = gateway.subscribe();
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<GatewayEvent>(64);

    // Reader: decode requests and funnel direct responses back.
    let request_gateway = Arc::clone(&gateway);
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let responses = match serde_json::from_str::<GatewayRequest>(&line) {
                Ok(request) => request_gateway.handle(request).await,
                Err(e) => vec![GatewayEvent::Error {
                    message: format!("malformed request: {e}"),
                }],
            };
            for event in responses {
                if reply_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });

    // Writer: interleave direct responses with the broadcast stream.
    loop {
        tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(event) => write_frame(&mut write_half, &event).await?,
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => {
                    write_frame(&mut write_half, &GatewayEvent::Event { event }).await?;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "observer lagged; events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    reader.abort();
    Ok(())
}

async fn write_frame(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    event: &GatewayEvent,
) -> anyhow::Result<()> {
    let mut frame = serde_json::to_vec(event)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    Ok(())
}

//! Minimal administrative IPC channel (spec.md §6 CLI surface).
//!
//! `core serve` listens on a Unix domain socket at `config.listen_path`
//! and accepts line-delimited JSON requests; the `core agents list` /
//! `core plan status` / `core shutdown` subcommands are one-shot
//! clients against that socket. This is deliberately separate from the
//! binary wire format in [`agentmesh_shared::wire`], which is the
//! agent-to-agent message protocol, not the operator control channel.

use agentmesh_shared::ids::PlanId;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::Runtime;

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    AgentsList,
    PlanStatus { plan_id: PlanId },
    Shutdown { drain: bool },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok(serde_json::Value),
    Err(String),
}

/// Runs the control-channel accept loop until `runtime.shutdown()` is
/// invoked (shutdown itself arrives as a request on this very socket or
/// via ctrl-c in `main`).
pub async fn serve(runtime: Arc<Runtime>, listen_path: &str) -> Result<()> {
    let _ = std::fs::remove_file(listen_path);
    let listener = UnixListener::bind(listen_path)
        .with_context(|| format!("failed to bind control socket at {listen_path}"))?;
    info!("control channel listening on {listen_path}");

    loop {
        let (stream, _) = listener.accept().await.context("accept failed on control socket")?;
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, runtime).await {
                warn!("control connection error: {e}");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, runtime: Arc<Runtime>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&runtime, request).await,
            Err(e) => Response::Err(format!("malformed request: {e}")),
        };
        let encoded = serde_json::to_string(&response)?;
        writer.write_all(encoded.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

async fn dispatch(runtime: &Arc<Runtime>, request: Request) -> Response {
    match request {
        Request::AgentsList => {
            let agents = runtime.registry.snapshot().await;
            match serde_json::to_value(
                agents
                    .iter()
                    .map(|a| serde_json::json!({ "name": a.name, "status": a.status }))
                    .collect::<Vec<_>>(),
            ) {
                Ok(value) => Response::Ok(value),
                Err(e) => Response::Err(e.to_string()),
            }
        }
        Request::PlanStatus { plan_id } => match runtime.planner.status(plan_id).await {
            Ok(status) => serde_json::to_value(status)
                .map(Response::Ok)
                .unwrap_or_else(|e| Response::Err(e.to_string())),
            Err(e) => Response::Err(e.to_string()),
        },
        Request::Shutdown { drain } => {
            if drain {
                info!("drain requested: waiting for in-flight plans is best-effort in this admin channel");
            }
            runtime.shutdown();
            Response::Ok(serde_json::json!({ "shutdown": true }))
        }
    }
}

/// Sends a single request to an already-running `core serve` and
/// returns its decoded response.
pub async fn request(listen_path: &str, request: Request) -> Result<Response> {
    let stream = UnixStream::connect(listen_path)
        .await
        .with_context(|| format!("failed to connect to control socket at {listen_path}"))?;
    let (reader, mut writer) = stream.into_split();

    let encoded = serde_json::to_string(&request)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => bail!("control socket closed before responding"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = Request::PlanStatus { plan_id: PlanId::new() };
        let encoded = serde_json::to_string(&req).unwrap();
        let _: Request = serde_json::from_str(&encoded).unwrap();

        let ok = Response::Ok(serde_json::json!({"a": 1}));
        let encoded = serde_json::to_string(&ok).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, Response::Ok(_)));
    }
}

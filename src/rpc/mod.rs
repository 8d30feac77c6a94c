//! JSON-RPC surface over stream listeners.
//!
//! Requests and responses are newline-delimited JSON. The same service
//! object backs a filesystem socket and a TCP listener, both optional;
//! a listener that fails to come up is logged, and only having no listener
//! at all is fatal to the daemon.

mod api;

pub use api::{dispatch, Lab};

use crate::config::Config;
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};

#[derive(Debug, serde::Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, serde::Serialize)]
struct Response {
    id: Value,
    result: Value,
    error: Option<String>,
}

/// Bring up the configured listeners. Returns a description of each
/// endpoint that actually started.
pub async fn start(cfg: &Config, lab: Arc<Lab>) -> Vec<String> {
    let mut endpoints = Vec::new();

    if cfg.socket.enable {
        match listen_unix(cfg).await {
            Ok(listener) => {
                endpoints.push(format!("unix:{}", cfg.socket.path));
                tracing::info!("started listening unix:{}", cfg.socket.path);
                let lab = lab.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                tokio::spawn(handle_conn(stream, lab.clone()));
                            }
                            Err(err) => tracing::warn!("unix accept: {}", err),
                        }
                    }
                });
            }
            Err(err) => tracing::error!("unix listener: {}", err),
        }
    }

    if cfg.tcp.enable {
        match TcpListener::bind(&cfg.tcp.listen).await {
            Ok(listener) => {
                endpoints.push(format!("tcp:{}", cfg.tcp.listen));
                tracing::info!("started listening tcp:{}", cfg.tcp.listen);
                let lab = lab.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                tokio::spawn(handle_conn(stream, lab.clone()));
                            }
                            Err(err) => tracing::warn!("tcp accept: {}", err),
                        }
                    }
                });
            }
            Err(err) => tracing::error!("tcp listener: {}", err),
        }
    }

    endpoints
}

/// Bind the control socket and apply the configured ownership and mode.
/// Permission failures are logged, not fatal.
async fn listen_unix(cfg: &Config) -> std::io::Result<UnixListener> {
    // a previous run may have left the socket file behind
    let _ = std::fs::remove_file(&cfg.socket.path);
    let listener = UnixListener::bind(&cfg.socket.path)?;

    let perms = std::fs::Permissions::from_mode(cfg.socket.mode);
    if let Err(err) = std::fs::set_permissions(&cfg.socket.path, perms) {
        tracing::warn!("chmod {}: {}", cfg.socket.path, err);
    }
    if cfg.socket.user.is_some() || cfg.socket.group.is_some() {
        if let Err(err) =
            std::os::unix::fs::chown(&cfg.socket.path, cfg.socket.user, cfg.socket.group)
        {
            tracing::warn!("chown {}: {}", cfg.socket.path, err);
        }
    }
    Ok(listener)
}

/// Serve one connection: requests in, responses out, line by line.
pub async fn handle_conn<S>(stream: S, lab: Arc<Lab>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!("connection read: {}", err);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = respond(&lab, &line).await;
        let mut text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("encoding response: {}", err);
                continue;
            }
        };
        text.push('\n');
        if writer.write_all(text.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn respond(lab: &Arc<Lab>, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(err) => {
            return Response {
                id: Value::Null,
                result: Value::Null,
                error: Some(format!("invalid request: {err}")),
            }
        }
    };

    match dispatch(lab, &req.method, req.params).await {
        Ok(result) => Response {
            id: req.id,
            result,
            error: None,
        },
        Err(error) => Response {
            id: req.id,
            result: Value::Null,
            error: Some(error),
        },
    }
}

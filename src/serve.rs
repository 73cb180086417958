//! Newline-delimited JSON request loop.
//!
//! Each input line is one request object tagged by `op`. Requests run
//! concurrently; every reply is written as a single line carrying the
//! request's `id` back so callers can correlate out-of-order answers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::Cached;
use crate::error_taxonomy::{ClassifiedError, CommandResponse};
use crate::service::{BridgeService, OperationRequest, REJECTED_EXIT_CODE};

/// How often exited background sessions are reaped while serving.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServeRequest {
    Exec {
        request: OperationRequest,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Start {
        request: OperationRequest,
    },
    Stop {
        session_id: String,
    },
    Session {
        session_id: String,
    },
    Sessions,
    Sdks {
        #[serde(default)]
        refresh: bool,
    },
    Runtimes {
        #[serde(default)]
        refresh: bool,
    },
    Version {
        #[serde(default)]
        refresh: bool,
    },
    CacheStats,
    ClearCache {
        #[serde(default)]
        reset_metrics: bool,
    },
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        json!({ "success": false, "error": format!("Failed to serialize reply: {err}") })
    })
}

fn rejected(message: impl Into<String>) -> Value {
    to_json(&CommandResponse::failure(
        ClassifiedError::validation(message),
        REJECTED_EXIT_CODE,
    ))
}

fn cached_reply<T: Serialize>(result: Result<Cached<T>, CommandResponse>, field: &str) -> Value {
    match result {
        Ok(cached) => {
            let mut reply = json!({
                "success": true,
                "fromCache": cached.metadata.from_cache,
                "loadedAt": cached.metadata.loaded_at,
                "ageSecs": cached.metadata.age.as_secs_f64(),
            });
            reply[field] = to_json(&*cached.value);
            reply
        }
        Err(response) => to_json(&response),
    }
}

/// Dispatch one parsed request.
pub async fn handle_request(
    service: &BridgeService,
    request: ServeRequest,
    shutdown: &CancellationToken,
) -> Value {
    match request {
        ServeRequest::Exec {
            request,
            timeout_secs,
        } => {
            let cancel = service.deadline_token(shutdown, timeout_secs.map(Duration::from_secs));
            let response = service.execute(request, &cancel).await;
            cancel.cancel();
            to_json(&response)
        }
        ServeRequest::Start { request } => match service.start_background(request) {
            Ok(started) => json!({ "success": true, "session": to_json(&started) }),
            Err(response) => to_json(&response),
        },
        ServeRequest::Stop { session_id } => to_json(&service.stop_session(&session_id).await),
        ServeRequest::Session { session_id } => match service.session_info(&session_id) {
            Some(details) => json!({ "success": true, "session": to_json(&details) }),
            None => rejected(format!("Session '{session_id}' not found")),
        },
        ServeRequest::Sessions => json!({ "success": true, "sessions": to_json(&service.sessions()) }),
        ServeRequest::Sdks { refresh } => {
            cached_reply(service.installed_sdks(refresh, shutdown).await, "sdks")
        }
        ServeRequest::Runtimes { refresh } => {
            cached_reply(service.installed_runtimes(refresh, shutdown).await, "runtimes")
        }
        ServeRequest::Version { refresh } => {
            cached_reply(service.tool_version(refresh, shutdown).await, "version")
        }
        ServeRequest::CacheStats => {
            json!({ "success": true, "cacheStats": to_json(&service.cache_stats()) })
        }
        ServeRequest::ClearCache { reset_metrics } => {
            service.clear_caches();
            if reset_metrics {
                service.reset_cache_metrics();
            }
            json!({ "success": true })
        }
    }
}

/// Parse and answer one input line. Always yields exactly one reply line.
pub async fn handle_line(
    service: &BridgeService,
    line: &str,
    shutdown: &CancellationToken,
) -> String {
    let (id, response) = match serde_json::from_str::<Value>(line) {
        Ok(value) => {
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            let response = match serde_json::from_value::<ServeRequest>(value) {
                Ok(request) => handle_request(service, request, shutdown).await,
                Err(err) => rejected(format!("Invalid request: {err}")),
            };
            (id, response)
        }
        Err(err) => (Value::Null, rejected(format!("Invalid JSON: {err}"))),
    };
    json!({ "id": id, "response": response }).to_string()
}

/// Serve requests from `input` until EOF or `shutdown`, then stop every
/// background session.
///
/// Replies go through one writer task so lines never interleave.
pub async fn run<R, W>(
    service: Arc<BridgeService>,
    input: R,
    output: W,
    shutdown: CancellationToken,
    sweep_interval: Duration,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut lines = input.lines();
    let mut tasks = JoinSet::new();
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let service = Arc::clone(&service);
                let tx = tx.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    let reply = handle_line(&service, &line, &shutdown).await;
                    // Receiver only goes away once the loop has finished.
                    let _ = tx.send(reply);
                });
            }
            _ = sweep.tick() => {
                let reaped = service.cleanup_sessions();
                if reaped > 0 {
                    debug!(reaped, "reaped exited sessions");
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "request task failed");
                }
            }
            () = shutdown.cancelled() => break,
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "request task failed");
        }
    }
    service.shutdown().await;

    drop(tx);
    writer.await.map_err(io::Error::other)?
}

//! Plugin-side runtime: handshake, frame loop, and lifecycle dispatch.
//!
//! A plugin binary hands its [`Plugin`] implementation to [`serve`], which
//! owns stdin/stdout for the lifetime of the process. The host closes the
//! channel (or kills the process) to shut the plugin down; `serve` returns
//! cleanly on EOF.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::Plugin;
use crate::error::PluginError;
use crate::proto::{
    ERROR_INVALID_PARAMS, ERROR_METHOD_NOT_FOUND, EvalParams, EvalReply, Frame,
    HANDSHAKE_COOKIE_ENV, HANDSHAKE_COOKIE_VALUE, LifecycleParams, LifecycleReply, METHOD_DISABLE,
    METHOD_ENABLE, METHOD_EVAL, ResultCode, RpcError, handshake_line,
};

/// Capacity of the channels between the frame loop and the IO tasks.
const CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>>>;

/// Handle a plugin uses to call back into the host.
///
/// Valid only for the duration of the lifecycle call it was passed into; the
/// host revokes the broker token as soon as that call returns, after which
/// `eval` is answered with an error.
#[derive(Clone)]
pub struct Helper {
    broker: u64,
    outgoing_tx: mpsc::Sender<Frame>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

impl Helper {
    /// Ask the host to evaluate an expression on the plugin's behalf.
    pub async fn eval(&self, expr: &str) -> Result<String, PluginError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast reply cannot be lost.
        self.pending.lock().await.insert(id, tx);

        let params = serde_json::to_value(EvalParams {
            broker: self.broker,
            expr: expr.to_string(),
        })
        .map_err(|e| PluginError::Serialization(e.to_string()))?;
        let frame = Frame::Request {
            id,
            method: METHOD_EVAL.to_string(),
            params: Some(params),
        };
        if self.outgoing_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(PluginError::protocol("connection to host closed"));
        }

        match rx.await {
            Ok(Ok(result)) => {
                let reply: EvalReply = serde_json::from_value(result)
                    .map_err(|e| PluginError::Serialization(e.to_string()))?;
                Ok(reply.value)
            }
            Ok(Err(err)) => Err(PluginError::Helper(err.message)),
            Err(_) => Err(PluginError::protocol("connection to host closed")),
        }
    }
}

/// Run a plugin over the process's stdin/stdout.
///
/// Refuses to start when the handshake cookie is absent from the
/// environment: the binary was launched by hand, not by a host.
pub async fn serve<P: Plugin>(plugin: P) -> Result<(), PluginError> {
    if std::env::var(HANDSHAKE_COOKIE_ENV).as_deref() != Ok(HANDSHAKE_COOKIE_VALUE) {
        return Err(PluginError::protocol(
            "this binary is an atrium plugin and must be launched by an atrium host",
        ));
    }
    serve_with_streams(plugin, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Run a plugin over an arbitrary stream pair.
///
/// Split out from [`serve`] so the full protocol is testable over in-memory
/// duplex streams without spawning a process.
pub async fn serve_with_streams<P, R, W>(
    mut plugin: P,
    reader: R,
    writer: W,
) -> Result<(), PluginError>
where
    P: Plugin,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(1));

    // Writer task: handshake line first, then frames.
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        let line = handshake_line();
        if writer.write_all(line.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
            || writer.flush().await.is_err()
        {
            return;
        }
        while let Some(frame) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize frame");
                    continue;
                }
            };
            if writer.write_all(json.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
    });

    // Reader task: requests go to the frame loop, replies to the pending map.
    let (incoming_tx, mut incoming_rx) =
        mpsc::channel::<(u64, String, Option<serde_json::Value>)>(CHANNEL_CAPACITY);
    let reader_task = tokio::spawn({
        let pending = pending.clone();
        async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Request { id, method, params }) => {
                        if incoming_tx.send((id, method, params)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Response { id, result }) => {
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(Ok(result));
                        }
                    }
                    Ok(Frame::Error { id, error }) => {
                        if let Some(tx) = pending.lock().await.remove(&id) {
                            let _ = tx.send(Err(error));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Discarding unparsable frame from host");
                    }
                }
            }
        }
    });

    // Frame loop: lifecycle calls run here, one at a time, while the reader
    // task keeps routing eval replies underneath them.
    while let Some((id, method, params)) = incoming_rx.recv().await {
        let frame = match method.as_str() {
            METHOD_ENABLE | METHOD_DISABLE => {
                let params = params
                    .and_then(|p| serde_json::from_value::<LifecycleParams>(p).ok());
                match params {
                    Some(params) => {
                        let helper = Helper {
                            broker: params.broker,
                            outgoing_tx: outgoing_tx.clone(),
                            pending: pending.clone(),
                            next_id: next_id.clone(),
                        };
                        let result = if method == METHOD_ENABLE {
                            plugin.on_enable(&helper).await
                        } else {
                            plugin.on_disable(&helper).await
                        };
                        let code = match result {
                            Ok(()) => ResultCode::Ok,
                            Err(e) => {
                                tracing::error!(method = %method, error = %e, "Lifecycle handler failed");
                                ResultCode::Error
                            }
                        };
                        match serde_json::to_value(LifecycleReply { code }) {
                            Ok(result) => Frame::Response { id, result },
                            Err(e) => Frame::Error {
                                id,
                                error: RpcError::new(ERROR_INVALID_PARAMS, e.to_string()),
                            },
                        }
                    }
                    None => Frame::Error {
                        id,
                        error: RpcError::new(ERROR_INVALID_PARAMS, "missing broker token"),
                    },
                }
            }
            other => Frame::Error {
                id,
                error: RpcError::new(ERROR_METHOD_NOT_FOUND, format!("unknown method: {other}")),
            },
        };
        if outgoing_tx.send(frame).await.is_err() {
            break;
        }
    }

    // Reader hit EOF (host side closed). Let the writer drain and stop.
    drop(outgoing_tx);
    let _ = writer_task.await;
    reader_task.abort();
    Ok(())
}

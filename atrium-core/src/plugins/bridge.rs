//! Host-side RPC bridge
//!
//! [`PluginClient`] wraps one plugin connection and exposes the two
//! lifecycle calls. Both call directions share the connection: outgoing
//! requests are matched to responses through a pending map, and incoming
//! `helper/eval` requests are routed through the [`CallbackBroker`], which
//! only answers while a lifecycle call is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use atrium_plugin_api::proto::{
    ERROR_BROKER_CLOSED, ERROR_EVAL_FAILED, ERROR_INVALID_PARAMS, ERROR_METHOD_NOT_FOUND,
    EvalParams, EvalReply, Frame, LifecycleParams, LifecycleReply, METHOD_DISABLE, METHOD_ENABLE,
    METHOD_EVAL, ResultCode, RpcError,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time;

use super::error::PluginHostError;
use super::helper::EvalHelper;

/// Capacity of the channel feeding the writer task.
const CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>>>;

/// Per-connection table of open callback channels.
///
/// A token is registered immediately before the outer lifecycle call is
/// sent and revoked on every exit path of that call, so an `eval` arriving
/// outside its parent call finds no slot and is answered with an error.
struct CallbackBroker {
    slots: Mutex<HashMap<u64, Arc<dyn EvalHelper>>>,
    next: AtomicU64,
}

impl CallbackBroker {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    async fn register(&self, helper: Arc<dyn EvalHelper>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::SeqCst);
        self.slots.lock().await.insert(token, helper);
        token
    }

    async fn revoke(&self, token: u64) {
        self.slots.lock().await.remove(&token);
    }

    async fn get(&self, token: u64) -> Option<Arc<dyn EvalHelper>> {
        self.slots.lock().await.get(&token).cloned()
    }
}

/// Connected RPC stub for one running plugin process.
pub struct PluginClient {
    outgoing_tx: mpsc::Sender<Frame>,
    pending: PendingMap,
    next_id: AtomicU64,
    broker: Arc<CallbackBroker>,
    helper: Arc<dyn EvalHelper>,
}

impl PluginClient {
    /// Build a client over an arbitrary stream pair.
    ///
    /// The launcher hands in the child's stdio after the handshake; tests
    /// hand in in-memory duplex streams.
    pub fn with_streams<R, W>(reader: R, writer: W, helper: Arc<dyn EvalHelper>) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let broker = Arc::new(CallbackBroker::new());

        // Writer task: serialize frames to the plugin.
        tokio::spawn(async move {
            let mut writer = writer;
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

        // Reader task: replies resolve the pending map, incoming eval
        // requests are served through the broker.
        tokio::spawn({
            let pending = pending.clone();
            let broker = broker.clone();
            let outgoing_tx = outgoing_tx.clone();
            async move {
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Frame>(&line) {
                        Ok(Frame::Response { id, result }) => {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(Ok(result));
                            } else {
                                tracing::warn!(id, "No pending request for response");
                            }
                        }
                        Ok(Frame::Error { id, error }) => {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(Err(error));
                            }
                        }
                        Ok(Frame::Request { id, method, params }) => {
                            Self::serve_callback(
                                id,
                                method,
                                params,
                                broker.clone(),
                                outgoing_tx.clone(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Discarding unparsable frame from plugin");
                        }
                    }
                }
            }
        });

        Self {
            outgoing_tx,
            pending,
            next_id: AtomicU64::new(1),
            broker,
            helper,
        }
    }

    /// Issue `plugin/enable`, scoped to a fresh callback channel.
    pub async fn enable(&self, timeout: Duration) -> Result<ResultCode, PluginHostError> {
        self.lifecycle(METHOD_ENABLE, timeout).await
    }

    /// Issue `plugin/disable`, scoped to a fresh callback channel.
    pub async fn disable(&self, timeout: Duration) -> Result<ResultCode, PluginHostError> {
        self.lifecycle(METHOD_DISABLE, timeout).await
    }

    async fn lifecycle(
        &self,
        method: &str,
        timeout: Duration,
    ) -> Result<ResultCode, PluginHostError> {
        let token = self.broker.register(self.helper.clone()).await;
        let result = self
            .request(
                method,
                serde_json::to_value(LifecycleParams { broker: token })
                    .map_err(|e| PluginHostError::Rpc(e.to_string()))?,
                timeout,
            )
            .await;
        // The callback channel must never outlive its parent call.
        self.broker.revoke(token).await;

        let reply: LifecycleReply = serde_json::from_value(result?)
            .map_err(|e| PluginHostError::Rpc(format!("malformed {method} reply: {e}")))?;
        Ok(reply.code)
    }

    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, PluginHostError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so a fast reply cannot be lost.
        self.pending.lock().await.insert(id, tx);

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            params: Some(params),
        };
        if self.outgoing_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(PluginHostError::Rpc("connection closed".to_string()));
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(PluginHostError::Rpc(format!(
                "plugin returned error {}: {}",
                err.code, err.message
            ))),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(PluginHostError::Rpc("connection closed".to_string()))
            }
            Err(_) => {
                // Reclaim the slot so a late reply is dropped, not leaked.
                self.pending.lock().await.remove(&id);
                Err(PluginHostError::Timeout { after: timeout })
            }
        }
    }

    /// Serve one incoming plugin→host request off the reader task.
    ///
    /// Spawned so a slow eval cannot stall response routing.
    fn serve_callback(
        id: u64,
        method: String,
        params: Option<serde_json::Value>,
        broker: Arc<CallbackBroker>,
        outgoing_tx: mpsc::Sender<Frame>,
    ) {
        tokio::spawn(async move {
            let frame = if method == METHOD_EVAL {
                match params.and_then(|p| serde_json::from_value::<EvalParams>(p).ok()) {
                    Some(params) => match broker.get(params.broker).await {
                        Some(helper) => match helper.eval(&params.expr).await {
                            Ok(value) => match serde_json::to_value(EvalReply { value }) {
                                Ok(result) => Frame::Response { id, result },
                                Err(e) => Frame::Error {
                                    id,
                                    error: RpcError::new(ERROR_EVAL_FAILED, e.to_string()),
                                },
                            },
                            Err(e) => Frame::Error {
                                id,
                                error: RpcError::new(ERROR_EVAL_FAILED, e.to_string()),
                            },
                        },
                        None => Frame::Error {
                            id,
                            error: RpcError::new(
                                ERROR_BROKER_CLOSED,
                                "no callback channel open for this call",
                            ),
                        },
                    },
                    None => Frame::Error {
                        id,
                        error: RpcError::new(ERROR_INVALID_PARAMS, "malformed eval params"),
                    },
                }
            } else {
                Frame::Error {
                    id,
                    error: RpcError::new(
                        ERROR_METHOD_NOT_FOUND,
                        format!("unknown method: {method}"),
                    ),
                }
            };
            let _ = outgoing_tx.send(frame).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::helper::{HelperError, NullHelper};
    use async_trait::async_trait;
    use tokio::io::BufReader;

    struct Upper;

    #[async_trait]
    impl EvalHelper for Upper {
        async fn eval(&self, expr: &str) -> Result<String, HelperError> {
            Ok(expr.to_uppercase())
        }
    }

    async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Frame {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) {
        let mut json = serde_json::to_string(frame).unwrap();
        json.push('\n');
        writer.write_all(json.as_bytes()).await.unwrap();
    }

    fn client_pair() -> (
        PluginClient,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (host_side, plugin_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let client = PluginClient::with_streams(BufReader::new(host_read), host_write, Arc::new(Upper));
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        (client, BufReader::new(plugin_read), plugin_write)
    }

    #[tokio::test]
    async fn test_enable_round_trip() {
        let (client, mut plugin_read, mut plugin_write) = client_pair();

        let call = tokio::spawn(async move { client.enable(Duration::from_secs(5)).await });

        let frame = read_frame(&mut plugin_read).await;
        let id = match frame {
            Frame::Request { id, method, params } => {
                assert_eq!(method, METHOD_ENABLE);
                let params: LifecycleParams =
                    serde_json::from_value(params.unwrap()).unwrap();
                assert!(params.broker > 0);
                id
            }
            other => panic!("expected request, got {other:?}"),
        };
        write_frame(
            &mut plugin_write,
            &Frame::Response {
                id,
                result: serde_json::to_value(LifecycleReply {
                    code: ResultCode::Ok,
                })
                .unwrap(),
            },
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), ResultCode::Ok);
    }

    #[tokio::test]
    async fn test_enable_reports_remote_error_code() {
        let (client, mut plugin_read, mut plugin_write) = client_pair();

        let call = tokio::spawn(async move { client.enable(Duration::from_secs(5)).await });

        let id = match read_frame(&mut plugin_read).await {
            Frame::Request { id, .. } => id,
            other => panic!("expected request, got {other:?}"),
        };
        write_frame(
            &mut plugin_write,
            &Frame::Response {
                id,
                result: serde_json::to_value(LifecycleReply {
                    code: ResultCode::Error,
                })
                .unwrap(),
            },
        )
        .await;

        assert_eq!(call.await.unwrap().unwrap(), ResultCode::Error);
    }

    #[tokio::test]
    async fn test_call_times_out_and_reclaims_pending_slot() {
        let (client, mut plugin_read, _plugin_write) = client_pair();

        let call = tokio::spawn(async move {
            let res = client.enable(Duration::from_millis(50)).await;
            (client, res)
        });

        // Read the request but never answer it.
        let frame = read_frame(&mut plugin_read).await;
        assert!(matches!(frame, Frame::Request { .. }));

        let (client, res) = call.await.unwrap();
        assert!(matches!(res.unwrap_err(), PluginHostError::Timeout { .. }));
        assert!(client.pending.lock().await.is_empty());
        assert!(client.broker.slots.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_eval_served_during_lifecycle_call() {
        let (client, mut plugin_read, mut plugin_write) = client_pair();

        let call = tokio::spawn(async move { client.enable(Duration::from_secs(5)).await });

        let (id, broker) = match read_frame(&mut plugin_read).await {
            Frame::Request { id, params, .. } => {
                let params: LifecycleParams =
                    serde_json::from_value(params.unwrap()).unwrap();
                (id, params.broker)
            }
            other => panic!("expected request, got {other:?}"),
        };

        // Call back while the enable is still open.
        write_frame(
            &mut plugin_write,
            &Frame::Request {
                id: 900,
                method: METHOD_EVAL.to_string(),
                params: Some(
                    serde_json::to_value(EvalParams {
                        broker,
                        expr: "ping".to_string(),
                    })
                    .unwrap(),
                ),
            },
        )
        .await;
        match read_frame(&mut plugin_read).await {
            Frame::Response { id, result } => {
                assert_eq!(id, 900);
                let reply: EvalReply = serde_json::from_value(result).unwrap();
                assert_eq!(reply.value, "PING");
            }
            other => panic!("expected eval response, got {other:?}"),
        }

        write_frame(
            &mut plugin_write,
            &Frame::Response {
                id,
                result: serde_json::to_value(LifecycleReply {
                    code: ResultCode::Ok,
                })
                .unwrap(),
            },
        )
        .await;
        assert_eq!(call.await.unwrap().unwrap(), ResultCode::Ok);
    }

    #[tokio::test]
    async fn test_eval_with_stale_token_is_rejected() {
        let (_client, mut plugin_read, mut plugin_write) = client_pair();

        // No lifecycle call in flight, so no token is registered.
        write_frame(
            &mut plugin_write,
            &Frame::Request {
                id: 901,
                method: METHOD_EVAL.to_string(),
                params: Some(
                    serde_json::to_value(EvalParams {
                        broker: 12345,
                        expr: "ping".to_string(),
                    })
                    .unwrap(),
                ),
            },
        )
        .await;
        match read_frame(&mut plugin_read).await {
            Frame::Error { id, error } => {
                assert_eq!(id, 901);
                assert_eq!(error.code, ERROR_BROKER_CLOSED);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_revoked_after_call_returns() {
        let (client, mut plugin_read, mut plugin_write) = client_pair();

        let call = tokio::spawn(async move {
            let code = client.enable(Duration::from_secs(5)).await;
            (client, code)
        });

        let (id, broker) = match read_frame(&mut plugin_read).await {
            Frame::Request { id, params, .. } => {
                let params: LifecycleParams =
                    serde_json::from_value(params.unwrap()).unwrap();
                (id, params.broker)
            }
            other => panic!("expected request, got {other:?}"),
        };
        write_frame(
            &mut plugin_write,
            &Frame::Response {
                id,
                result: serde_json::to_value(LifecycleReply {
                    code: ResultCode::Ok,
                })
                .unwrap(),
            },
        )
        .await;
        let (_client, code) = call.await.unwrap();
        assert_eq!(code.unwrap(), ResultCode::Ok);

        // The broker token from the finished call no longer answers.
        write_frame(
            &mut plugin_write,
            &Frame::Request {
                id: 902,
                method: METHOD_EVAL.to_string(),
                params: Some(
                    serde_json::to_value(EvalParams {
                        broker,
                        expr: "late".to_string(),
                    })
                    .unwrap(),
                ),
            },
        )
        .await;
        match read_frame(&mut plugin_read).await {
            Frame::Error { error, .. } => assert_eq!(error.code, ERROR_BROKER_CLOSED),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_callback_method_is_rejected() {
        let (_client, mut plugin_read, mut plugin_write) = client_pair();

        write_frame(
            &mut plugin_write,
            &Frame::Request {
                id: 903,
                method: "host/format-disk".to_string(),
                params: None,
            },
        )
        .await;
        match read_frame(&mut plugin_read).await {
            Frame::Error { error, .. } => assert_eq!(error.code, ERROR_METHOD_NOT_FOUND),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_helper_rejects_eval() {
        let (host_side, plugin_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let client =
            PluginClient::with_streams(BufReader::new(host_read), host_write, Arc::new(NullHelper));
        let (plugin_read, mut plugin_write) = tokio::io::split(plugin_side);
        let mut plugin_read = BufReader::new(plugin_read);

        let call = tokio::spawn(async move {
            let code = client.enable(Duration::from_secs(5)).await;
            (client, code)
        });
        let (id, broker) = match read_frame(&mut plugin_read).await {
            Frame::Request { id, params, .. } => {
                let params: LifecycleParams =
                    serde_json::from_value(params.unwrap()).unwrap();
                (id, params.broker)
            }
            other => panic!("expected request, got {other:?}"),
        };

        write_frame(
            &mut plugin_write,
            &Frame::Request {
                id: 904,
                method: METHOD_EVAL.to_string(),
                params: Some(
                    serde_json::to_value(EvalParams {
                        broker,
                        expr: "ping".to_string(),
                    })
                    .unwrap(),
                ),
            },
        )
        .await;
        match read_frame(&mut plugin_read).await {
            Frame::Error { error, .. } => assert_eq!(error.code, ERROR_EVAL_FAILED),
            other => panic!("expected error, got {other:?}"),
        }

        write_frame(
            &mut plugin_write,
            &Frame::Response {
                id,
                result: serde_json::to_value(LifecycleReply {
                    code: ResultCode::Ok,
                })
                .unwrap(),
            },
        )
        .await;
        let (_client, code) = call.await.unwrap();
        assert_eq!(code.unwrap(), ResultCode::Ok);
    }
}

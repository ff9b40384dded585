//! # Control Channel Module / 控制通道模块
//!
//! Request/response calls over a boundary transport. A pump task routes
//! incoming frames: events go to the progress handle of the environment,
//! responses go to the waiting caller.
//!
//! 通过边界传输进行请求/响应调用。一个泵任务负责路由传入的帧：
//! 事件发送到环境的进度句柄，响应发送给等待中的调用者。

use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{HostError, RemoteFaultError};
use crate::core::protocol::{Frame, HANDSHAKE_OP, Hello, PROTOCOL_VERSION, Request, Response};
use crate::infra::boundary::Transport;
use crate::reporting::progress::ProgressHandle;

pub struct ControlChannel {
    outgoing: mpsc::UnboundedSender<Frame>,
    responses: mpsc::UnboundedReceiver<Result<Response, String>>,
    pump: JoinHandle<()>,
    next_id: u64,
}

impl ControlChannel {
    pub fn open(transport: Transport, progress: ProgressHandle) -> Self {
        let Transport {
            outgoing,
            mut incoming,
        } = transport;
        let (responses_tx, responses) = mpsc::unbounded_channel();

        let pump = tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                let routed = match frame {
                    Ok(Frame::Event { event }) => {
                        progress.apply(event);
                        continue;
                    }
                    Ok(Frame::Response(response)) => Ok(response),
                    Ok(other) => Err(format!("unexpected frame from host: {other:?}")),
                    Err(message) => Err(message),
                };
                if responses_tx.send(routed).is_err() {
                    break;
                }
            }
        });

        Self {
            outgoing,
            responses,
            pump,
            next_id: 1,
        }
    }

    /// Checks that the host speaks this protocol version.
    pub async fn handshake(&mut self, timeout: Duration) -> Result<Hello, HostError> {
        let response = self
            .call(HANDSHAKE_OP, Value::Null, timeout, None)
            .await
            .map_err(|fault| HostError::Handshake(fault.to_string()))?;
        if !response.is_ok() {
            return Err(HostError::Handshake(format!(
                "host refused the handshake: {}",
                response.message().unwrap_or("no reason given")
            )));
        }

        let hello: Hello = serde_json::from_value(response.payload)
            .map_err(|e| HostError::Handshake(format!("malformed handshake: {e}")))?;
        if hello.version != PROTOCOL_VERSION {
            return Err(HostError::Handshake(format!(
                "protocol version {} is not supported (expected {})",
                hello.version, PROTOCOL_VERSION
            )));
        }
        debug!(pid = hello.pid, "handshake completed");
        Ok(hello)
    }

    /// Sends a request and waits for its response.
    ///
    /// When `cancel` fires a `cancel` frame is sent once and the response is
    /// still awaited; the host answers a cancelled request with a
    /// `cancelled` response. Responses to earlier requests are discarded.
    ///
    /// 发送请求并等待其响应。当 `cancel` 触发时只发送一次取消帧，并继续等待响应；
    /// 宿主会以 `cancelled` 响应回复被取消的请求。之前请求的响应会被丢弃。
    pub async fn call(
        &mut self,
        op: &str,
        payload: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, RemoteFaultError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Frame::Request(Request {
            id,
            op: op.to_string(),
            payload,
        });
        self.outgoing
            .send(request)
            .map_err(|_| RemoteFaultError::Disconnected)?;
        debug!(id, op, "request sent");

        let deadline = Instant::now() + timeout;
        let mut cancel_sent = false;
        loop {
            let received = tokio::select! {
                received = tokio::time::timeout_at(deadline, self.responses.recv()) => received,
                _ = cancelled(cancel), if !cancel_sent => {
                    cancel_sent = true;
                    debug!(id, "forwarding cancellation");
                    let _ = self.outgoing.send(Frame::Cancel { id });
                    continue;
                }
            };

            match received {
                Err(_) => return Err(RemoteFaultError::Timeout(timeout)),
                Ok(None) => return Err(RemoteFaultError::Disconnected),
                Ok(Some(Err(message))) => return Err(RemoteFaultError::Protocol(message)),
                Ok(Some(Ok(response))) if response.id == id => return Ok(response),
                Ok(Some(Ok(response))) => debug!(id = response.id, "discarding stale response"),
            }
        }
    }

    /// Asks the host to stop serving.
    pub fn request_shutdown(&self) {
        let _ = self.outgoing.send(Frame::Shutdown);
    }

    /// Closes the outgoing side and stops routing incoming frames.
    pub fn close(self) {
        self.pump.abort();
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

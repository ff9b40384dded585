//! # Control Channel Protocol / 控制通道协议
//!
//! Frames exchanged between the coordinator and an isolated host. Every frame
//! is one JSON object tagged by `type`; the process transport writes one frame
//! per line.
//!
//! 协调器与隔离宿主之间交换的帧。每个帧都是一个以 `type` 标记的 JSON 对象；
//! 进程传输方式每行写入一个帧。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version announced in the handshake. A host speaking another version is
/// rejected before any request is sent.
pub const PROTOCOL_VERSION: u32 = 1;

/// Operation name of the handshake request.
pub const HANDSHAKE_OP: &str = "handshake";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Response(Response),
    Event { event: HostEvent },
    /// Asks the host to cancel the request with the given id.
    Cancel { id: u64 },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: ResponseStatus,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn ok(id: u64, payload: Value) -> Self {
        Self {
            id,
            status: ResponseStatus::Ok,
            payload,
        }
    }

    pub fn failed(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Failed,
            payload: Value::String(message.into()),
        }
    }

    pub fn cancelled(id: u64) -> Self {
        Self {
            id,
            status: ResponseStatus::Cancelled,
            payload: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// The failure message carried by a `failed` response.
    pub fn message(&self) -> Option<&str> {
        match self.status {
            ResponseStatus::Failed => self.payload.as_str(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Failed,
    Cancelled,
}

/// Asynchronous notifications sent by a host while requests are running.
/// 宿主在请求运行期间发送的异步通知。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostEvent {
    TaskChanged { name: String },
    Progress { completed: u64, total: u64 },
    Log { channel: String, text: String },
}

/// Handshake payload sent by the host in answer to [`HANDSHAKE_OP`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub pid: u32,
}

impl Frame {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

//! Frames exchanged on a remote-transport TCP connection.
//!
//! Each side opens with `hello` carrying its blessings. The server may answer
//! `rejected` instead. After the handshake the client sends `call` frames and
//! the server answers each with `result` or `error`, in order.

use serde::{Deserialize, Serialize};

use super::security::Blessings;

/// Client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        blessings: Blessings,
    },
    Call {
        id: u64,
        method: String,
        args: serde_json::Value,
    },
}

/// Server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        blessings: Blessings,
    },
    /// Client failed authorization; the server closes after sending this.
    Rejected {
        reason: String,
    },
    Result {
        id: u64,
        output: serde_json::Value,
    },
    Error {
        id: u64,
        message: String,
    },
}

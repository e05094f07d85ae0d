//! Synchronous cross-thread bridge
//!
//! A caller that must not yield (the engine's VFS hooks run on a plain
//! synchronous stack) drives filesystem calls on a dedicated worker thread
//! that owns all interaction with the asynchronous storage primitive. The two
//! sides share a [`SharedRegion`]: three integer control slots plus a call
//! buffer, a response buffer and optional bulk buffers.
//!
//! One call runs through these states:
//!
//! ```text
//! caller: write {method, args}, CALL_LENGTH, STATE = CALL    -> wait
//! worker: STATE = PROCESS, dispatch, write {value}|{error}
//!         RESPONSE_LENGTH, STATE = RESPONSE                   -> wait
//! caller: decode response
//! ```
//!
//! Reads and writes that do not name a shared bulk buffer move their bytes
//! through the response/call buffer one chunk at a time: the side holding
//! the next chunk raises `ASK_NEXT`, the other answers with `SEND_NEXT`.

mod client;
mod shared;
mod worker;

pub use client::SyncBridge;
pub use shared::SharedRegion;

use crate::core::fs::WriteFileOptions;
use crate::core::wal::MkdirOptions;
use crate::error::{Errno, FsError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control slot holding the [`State`]
pub const STATE: usize = 0;

/// Control slot holding the number of valid bytes in the call buffer
pub const CALL_LENGTH: usize = 1;

/// Control slot holding the number of valid bytes in the response buffer
pub const RESPONSE_LENGTH: usize = 2;

/// Buffer reference meaning "transfer through the chunked sub-protocol"
pub const CHUNKED: i32 = -1;

/// First fd handed out by the worker
pub const FIRST_FD: i32 = 10;

/// Values of the `STATE` slot
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle = 0,
    Call = 1,
    Process = 2,
    Response = 3,
    AskNext = 4,
    SendNext = 5,
}

/// One bridged call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCall", into = "RawCall")]
pub enum Call {
    Chmod { path: String, mode: u32 },
    Close { fd: i32 },
    Fstat { fd: i32 },
    Lstat { path: String },
    Mkdir { path: String, options: MkdirOptions },
    Open { path: String, flags: Option<String>, mode: Option<u32> },
    Readdir { path: String },
    /// `buffer` is a shared buffer index or [`CHUNKED`]
    Read { fd: i32, buffer: i32, offset: usize, length: usize, position: u64 },
    Write { fd: i32, buffer: i32, offset: usize, length: usize, position: u64 },
    Rename { old_path: String, new_path: String },
    Rmdir { path: String },
    Truncate { path: String, len: u64 },
    Unlink { path: String },
    Utimes { path: String, atime: u64, mtime: u64 },
    WriteFile { path: String, data: Vec<u8>, options: WriteFileOptions },
    /// Stop the worker
    Exit,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Chmod { .. } => "chmod",
            Call::Close { .. } => "close",
            Call::Fstat { .. } => "fstat",
            Call::Lstat { .. } => "lstat",
            Call::Mkdir { .. } => "mkdir",
            Call::Open { .. } => "open",
            Call::Readdir { .. } => "readdir",
            Call::Read { .. } => "read",
            Call::Write { .. } => "write",
            Call::Rename { .. } => "rename",
            Call::Rmdir { .. } => "rmdir",
            Call::Truncate { .. } => "truncate",
            Call::Unlink { .. } => "unlink",
            Call::Utimes { .. } => "utimes",
            Call::WriteFile { .. } => "writeFile",
            Call::Exit => "exit",
        }
    }
}

/// Wire shape: `{"method": "...", "args": [...]}`
#[derive(Serialize, Deserialize)]
struct RawCall {
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

struct Args {
    method: String,
    args: std::vec::IntoIter<Value>,
}

impl Args {
    fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.args.next().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| FsError::Protocol(format!("bad argument for {}: {}", self.method, e)))
    }
}

impl TryFrom<RawCall> for Call {
    type Error = FsError;

    fn try_from(raw: RawCall) -> Result<Self> {
        let mut a = Args {
            method: raw.method.clone(),
            args: raw.args.into_iter(),
        };
        let call = match raw.method.as_str() {
            "chmod" => Call::Chmod { path: a.next()?, mode: a.next()? },
            "close" => Call::Close { fd: a.next()? },
            "fstat" => Call::Fstat { fd: a.next()? },
            "lstat" => Call::Lstat { path: a.next()? },
            "mkdir" => Call::Mkdir {
                path: a.next()?,
                options: a.next::<Option<MkdirOptions>>()?.unwrap_or_default(),
            },
            "open" => Call::Open { path: a.next()?, flags: a.next()?, mode: a.next()? },
            "readdir" => Call::Readdir { path: a.next()? },
            "read" => Call::Read {
                fd: a.next()?,
                buffer: a.next()?,
                offset: a.next()?,
                length: a.next()?,
                position: a.next()?,
            },
            "write" => Call::Write {
                fd: a.next()?,
                buffer: a.next()?,
                offset: a.next()?,
                length: a.next()?,
                position: a.next()?,
            },
            "rename" => Call::Rename { old_path: a.next()?, new_path: a.next()? },
            "rmdir" => Call::Rmdir { path: a.next()? },
            "truncate" => Call::Truncate { path: a.next()?, len: a.next()? },
            "unlink" => Call::Unlink { path: a.next()? },
            "utimes" => Call::Utimes { path: a.next()?, atime: a.next()?, mtime: a.next()? },
            "writeFile" => Call::WriteFile {
                path: a.next()?,
                data: a.next()?,
                options: a.next::<Option<WriteFileOptions>>()?.unwrap_or_default(),
            },
            "exit" => Call::Exit,
            other => {
                return Err(FsError::Protocol(format!("Method not found: {}", other)));
            }
        };
        Ok(call)
    }
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl From<Call> for RawCall {
    fn from(call: Call) -> Self {
        let method = call.method().to_string();
        let args = match call {
            Call::Chmod { path, mode } => vec![path.into(), mode.into()],
            Call::Close { fd } | Call::Fstat { fd } => vec![fd.into()],
            Call::Lstat { path }
            | Call::Readdir { path }
            | Call::Rmdir { path }
            | Call::Unlink { path } => vec![path.into()],
            Call::Mkdir { path, options } => vec![path.into(), to_value(options)],
            Call::Open { path, flags, mode } => vec![path.into(), to_value(flags), to_value(mode)],
            Call::Read { fd, buffer, offset, length, position }
            | Call::Write { fd, buffer, offset, length, position } => vec![
                fd.into(),
                buffer.into(),
                offset.into(),
                length.into(),
                position.into(),
            ],
            Call::Rename { old_path, new_path } => vec![old_path.into(), new_path.into()],
            Call::Truncate { path, len } => vec![path.into(), len.into()],
            Call::Utimes { path, atime, mtime } => vec![path.into(), atime.into(), mtime.into()],
            Call::WriteFile { path, data, options } => {
                vec![path.into(), to_value(data), to_value(options)]
            }
            Call::Exit => Vec::new(),
        };
        RawCall { method, args }
    }
}

/// Error body carried across the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: i32,
}

/// `{"value": ...}` or `{"error": {"message", "code"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error { error: ErrorBody },
    Value { value: Value },
}

impl Response {
    pub fn value<T: Serialize>(value: T) -> Self {
        Response::Value {
            value: to_value(value),
        }
    }

    pub fn error(err: &FsError) -> Self {
        let message = match err {
            FsError::Errno { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Response::Error {
            error: ErrorBody {
                message,
                code: err.code().code(),
            },
        }
    }

    /// Decode the carried value, or rebuild the carried error with its code
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Response::Value { value } => Ok(serde_json::from_value(value)?),
            Response::Error { error } => Err(FsError::with_message(
                Errno::from_code(error.code),
                error.message,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_wire_format() {
        let call = Call::Read {
            fd: 10,
            buffer: CHUNKED,
            offset: 0,
            length: 4,
            position: 8,
        };
        assert_eq!(
            serde_json::to_string(&call).unwrap(),
            r#"{"method":"read","args":[10,-1,0,4,8]}"#
        );

        let open: Call = serde_json::from_str(r#"{"method":"open","args":["/f"]}"#).unwrap();
        assert_eq!(
            open,
            Call::Open {
                path: "/f".into(),
                flags: None,
                mode: None
            }
        );
        assert!(serde_json::from_str::<Call>(r#"{"method":"symlink","args":[]}"#).is_err());
    }

    #[test]
    fn test_response_round_trip_keeps_code() {
        let err = FsError::with_message(Errno::ENOENT, "Path not found: /x");
        let json = serde_json::to_string(&Response::error(&err)).unwrap();
        assert_eq!(json, r#"{"error":{"message":"Path not found: /x","code":44}}"#);

        let back: Response = serde_json::from_str(&json).unwrap();
        let err = back.into_result::<()>().unwrap_err();
        assert_eq!(err.code(), Errno::ENOENT);
        assert_eq!(err.to_string(), "Path not found: /x (44)");

        let ok: Response = serde_json::from_str(r#"{"value":12}"#).unwrap();
        assert_eq!(ok.into_result::<i32>().unwrap(), 12);
        let unit: Response = serde_json::from_str(r#"{"value":null}"#).unwrap();
        unit.into_result::<()>().unwrap();
    }
}

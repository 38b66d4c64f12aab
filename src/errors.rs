// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use anyhow::{anyhow, bail, Context, Error};

// We use `anyhow` for error handling.
// - Use `context()`/`with_context()` to annotate errors.
// - `ClientError` and `RemoteError` below are internal ones that need to be
//   checked at points other than the outermost error-checking layer:
//   `RemoteError` tells the caller to recompile locally, `ClientError`
//   carries the driver's numeric failure code.

pub type Result<T> = anyhow::Result<T>;

/// Broad classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unexpected message, missing reply, failed send.
    Protocol,
    /// Could not reach a peer.
    Connect,
    /// Local filesystem or pipe trouble.
    LocalIo,
    /// Bad or unusable configuration.
    Config,
    /// The remote rejected or failed the shipped environment.
    Verify,
    /// A policy forbids using this host.
    Policy,
    /// The remote reported a fault.
    Remote,
    /// Replica coordination failed.
    Orchestrator,
}

/// A failure of the remote build driver, carrying the numeric code that the
/// surrounding tooling logs and matches on.
#[derive(Debug)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub code: i32,
    pub msg: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, code: i32, msg: impl Into<String>) -> ClientError {
        ClientError {
            kind,
            code,
            msg: msg.into(),
        }
    }
}

impl std::error::Error for ClientError {}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {} - {}", self.code, self.msg)
    }
}

/// A remote-side condition that the caller is expected to recover from by
/// recompiling locally (codes 101 and 102). Everything else propagates.
#[derive(Debug)]
pub struct RemoteError {
    pub code: i32,
    pub msg: String,
}

impl RemoteError {
    pub fn new(code: i32, msg: impl Into<String>) -> RemoteError {
        RemoteError {
            code,
            msg: msg.into(),
        }
    }
}

impl std::error::Error for RemoteError {}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {} - {}", self.code, self.msg)
    }
}

pub fn client_error(kind: ErrorKind, code: i32, msg: impl Into<String>) -> Error {
    Error::new(ClientError::new(kind, code, msg))
}

pub fn remote_error(code: i32, msg: impl Into<String>) -> Error {
    Error::new(RemoteError::new(code, msg))
}

/// True if `err` signals that the compilation should be redone locally.
pub fn is_recoverable_remote_error(err: &Error) -> bool {
    err.downcast_ref::<RemoteError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let e = client_error(ErrorKind::Connect, 2, "no server found at box1");
        assert_eq!(format!("{}", e), "Error 2 - no server found at box1");
        assert_eq!(e.downcast_ref::<ClientError>().unwrap().code, 2);
        assert!(!is_recoverable_remote_error(&e));
    }

    #[test]
    fn test_remote_error_is_recoverable() {
        let e = remote_error(101, "the server ran out of memory");
        assert!(is_recoverable_remote_error(&e));
        assert_eq!(e.downcast_ref::<RemoteError>().unwrap().code, 101);
    }
}

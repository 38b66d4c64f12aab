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

//! Messages exchanged with the local daemon and with compile servers.
//!
//! Framing (length prefix, compression) is the channel's concern; see
//! [`crate::client::MsgChannel`].

use serde::{Deserialize, Serialize};

use crate::compiler::{CompileJob, Language};

/// The protocol version this driver speaks.
pub const PROTOCOL_VERSION: u32 = 42;

/// The oldest daemon protocol the driver will talk to at all.
pub const MIN_PROTOCOL_VERSION: u32 = 21;

/// Compile servers at or above this version support `VerifyEnv`.
pub const PROTOCOL_VERSION_VERIFY_ENV: u32 = 31;

/// One message on the wire, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Msg {
    /// Ask the scheduler (via the local daemon) for compile server(s).
    GetCs(GetCs),
    /// The scheduler's assignment of one compile server.
    UseCs(UseCs),
    /// Announce a job; to a compile server before the source stream, or to
    /// the local daemon when building locally on its behalf.
    CompileFile(CompileJob),
    /// One chunk of a streamed file (environment tarball, preprocessed
    /// source, or output artifact).
    FileChunk(FileChunk),
    /// Terminates a chunk stream.
    End,
    /// Announce an environment tarball upload.
    EnvTransfer(EnvTransfer),
    /// Ask the server to verify an installed environment.
    VerifyEnv(VerifyEnv),
    VerifyEnvResult(VerifyEnvResult),
    /// The compiler's exit status and captured output.
    CompileResult(CompileResult),
    /// Statistics for a job the submitter built itself.
    JobDone(JobDone),
    /// Tell the local daemon never to assign this environment to this host
    /// again.
    BlacklistHostEnv(BlacklistHostEnv),
    /// A free-form fault report; a server may send this at any point.
    StatusText(StatusText),
}

impl Msg {
    /// Short tag for diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Msg::GetCs(_) => "GetCs",
            Msg::UseCs(_) => "UseCs",
            Msg::CompileFile(_) => "CompileFile",
            Msg::FileChunk(_) => "FileChunk",
            Msg::End => "End",
            Msg::EnvTransfer(_) => "EnvTransfer",
            Msg::VerifyEnv(_) => "VerifyEnv",
            Msg::VerifyEnvResult(_) => "VerifyEnvResult",
            Msg::CompileResult(_) => "CompileResult",
            Msg::JobDone(_) => "JobDone",
            Msg::BlacklistHostEnv(_) => "BlacklistHostEnv",
            Msg::StatusText(_) => "StatusText",
        }
    }
}

/// Request for `count` compile server assignments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetCs {
    /// `(platform, version id)` pairs the submitter can ship.
    pub versions: Vec<(String, String)>,
    /// Fake identity key: the scheduler matches repeated compilations of the
    /// same unit by this string.
    pub filename: String,
    pub lang: Language,
    /// Number of assignments wanted (> 1 for a redundant build).
    pub count: u32,
    pub target_platform: String,
    /// Argument-shape flags, for scheduler-side job matching.
    pub arg_flags: Vec<String>,
    /// Empty if the user expressed no host preference.
    pub preferred_host: String,
    /// Minimal remote protocol version acceptable for this job.
    pub min_protocol: u32,
}

/// One compile server assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UseCs {
    pub hostname: String,
    pub port: u16,
    pub job_id: u32,
    pub host_platform: String,
    /// True if the server already has the required environment installed.
    pub got_env: bool,
    /// Diagnostic: the previously seen job this one was matched against.
    pub matched_job_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChunk {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvTransfer {
    pub target_platform: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyEnv {
    pub target_platform: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyEnvResult {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompileResult {
    pub status: i32,
    pub out: String,
    pub err: String,
    pub was_out_of_memory: bool,
    pub have_dwo_file: bool,
}

/// Job statistics reported to the local daemon so it can play proxy for the
/// submitter towards the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDone {
    pub job_id: u32,
    pub exitcode: i32,
    /// True when the submitter itself ran the compile.
    pub from_submitter: bool,
    pub real_msec: u32,
    pub user_msec: u32,
    pub sys_msec: u32,
    pub pfaults: u32,
    pub out_uncompressed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlacklistHostEnv {
    pub target_platform: String,
    pub version: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusText {
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_chunk_bincode_is_length_delimited() {
        let chunk = Msg::FileChunk(FileChunk {
            data: vec![0u8; 1000],
        });
        let bytes = bincode::serialize(&chunk).unwrap();
        // enum tag (4) + length (8) + payload
        assert!(bytes.len() < 1100, "encoded to {} bytes", bytes.len());
        match bincode::deserialize(&bytes).unwrap() {
            Msg::FileChunk(c) => assert_eq!(c.data.len(), 1000),
            other => panic!("decoded to {}", other.tag()),
        }
    }

    #[test]
    fn test_status_text_roundtrip() {
        let msg = Msg::StatusText(StatusText {
            text: "out of disk".into(),
        });
        let bytes = bincode::serialize(&msg).unwrap();
        assert_eq!(msg, bincode::deserialize(&bytes).unwrap());
    }
}

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

use crate::client::connect_with_retry;
use crate::cmdline::Command;
use crate::compiler::{self, CompileJob};
use crate::config::Config;
use crate::envs::parse_environments;
use crate::errors::*;
use crate::mock_command::ProcessCommandCreator;
use crate::remote::build_remote;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

/// The platform tag this host submits jobs as.
fn determine_platform() -> String {
    env::var("ICECC_PLATFORM").unwrap_or_else(|_| env::consts::ARCH.to_owned())
}

/// The environment-prefix filter for cross compilers: a compiler named
/// `arm-linux-gnueabi-gcc` wants environments tagged `arm-linux-gnueabi`.
fn compiler_prefix(compiler_name: &str) -> &str {
    for suffix in ["-gcc", "-g++", "-clang++", "-clang", "-cc", "-c++"] {
        if let Some(prefix) = compiler_name.strip_suffix(suffix) {
            return prefix;
        }
    }
    ""
}

/// Run a `Command` and return the process exit code to use.
pub fn run_command(cmd: Command) -> Result<i32> {
    match cmd {
        Command::Compile { exe, cmdline, cwd } => compile(exe, cmdline, cwd),
    }
}

fn compile(exe: OsString, cmdline: Vec<OsString>, cwd: PathBuf) -> Result<i32> {
    let cfg = Config::from_env();
    let target_platform = determine_platform();
    let mut job = CompileJob::analyze(&exe, &cmdline, &cwd, &target_platform)?;

    let descriptor = cfg
        .icecc_version
        .clone()
        .ok_or_else(|| anyhow!("ICECC_VERSION is not set"))?;
    let envs = parse_environments(
        &descriptor,
        &target_platform,
        compiler_prefix(&job.compiler_name),
    )?;

    let mut daemon = connect_with_retry(cfg.daemon_port)?;
    let mut creator = ProcessCommandCreator;

    match build_remote(
        &mut job,
        &mut daemon,
        &envs,
        cfg.repeat_rate,
        &mut creator,
        &cfg,
    ) {
        Ok(status) => Ok(status),
        Err(e) if is_recoverable_remote_error(&e) => {
            info!("{} - recompiling locally", e);
            compiler::build_local(&mut creator, &job)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiler_prefix() {
        assert_eq!(compiler_prefix("gcc"), "");
        assert_eq!(compiler_prefix("arm-linux-gnueabi-gcc"), "arm-linux-gnueabi");
        assert_eq!(compiler_prefix("x86_64-w64-mingw32-g++"), "x86_64-w64-mingw32");
        assert_eq!(compiler_prefix("clang"), "");
        assert_eq!(compiler_prefix("aarch64-linux-clang++"), "aarch64-linux");
    }

    #[test]
    fn test_determine_platform_is_nonempty() {
        assert!(!determine_platform().is_empty());
    }
}

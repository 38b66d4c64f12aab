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

//! One compile-server session, end to end: environment shipment and
//! verification, source stream, result collection, artifact reception.

use crate::client::MsgChannel;
use crate::compiler::{self, CompileJob};
use crate::config::Config;
use crate::errors::*;
use crate::mock_command::{CommandChild, CommandCreator};
use crate::protocol::{
    BlacklistHostEnv, EnvTransfer, FileChunk, Msg, UseCs, VerifyEnv, PROTOCOL_VERSION_VERIFY_ENV,
};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const CHUNK_RECV_TIMEOUT: Duration = Duration::from_secs(40);
const COMPILE_RESULT_TIMEOUT: Duration = Duration::from_secs(12 * 60);

const CHUNK_SIZE: usize = 100_000;

/// Compile `job` on the server named by `usecs`.
///
/// Returns the remote compiler's exit status. Failures come in three shapes:
/// local [`ClientError`]s with fixed codes, [`RemoteError`] 101/102 telling
/// the caller to recompile locally, and anything else unrecoverable.
/// `output` is set for the one replica whose captured stdout/stderr belongs
/// on the user's terminal.
#[allow(clippy::too_many_arguments)]
pub fn build_remote_int<T>(
    job: &mut CompileJob,
    usecs: &UseCs,
    local_daemon: &mut MsgChannel,
    environment: &str,
    version_file: &str,
    preproc_file: Option<&Path>,
    output: bool,
    creator: &mut T,
    cfg: &Config,
) -> Result<i32>
where
    T: CommandCreator,
{
    job.job_id = usecs.job_id;
    // Hoping on the scheduler's wisdom.
    job.environment_version = environment.to_owned();
    trace!(
        "Have to use host {}:{} - Job ID: {} - env: {} - has env: {} - match j: {}",
        usecs.hostname,
        usecs.port,
        job.job_id,
        usecs.host_platform,
        usecs.got_env,
        usecs.matched_job_id
    );

    let mut cserver = MsgChannel::connect(&usecs.hostname, usecs.port, CONNECT_TIMEOUT)
        .map_err(|_| {
            error!(
                "no server found behind given hostname {}:{}",
                usecs.hostname, usecs.port
            );
            client_error(
                ErrorKind::Connect,
                2,
                format!("no server found at {}", usecs.hostname),
            )
        })?;

    let result = run_session(
        job,
        usecs,
        local_daemon,
        &mut cserver,
        version_file,
        preproc_file,
        output,
        creator,
        cfg,
    );

    if result.is_err() {
        // Handle pending status messages, if any, so the user sees the
        // remote-side context for the failure.
        while let Some(msg) = cserver.try_get_msg() {
            if let Msg::StatusText(st) = msg {
                error!(
                    "Remote status (compiled on {}): {}",
                    cserver.name, st.text
                );
            }
        }
    }

    result
}

#[allow(clippy::too_many_arguments)]
fn run_session<T>(
    job: &mut CompileJob,
    usecs: &UseCs,
    local_daemon: &mut MsgChannel,
    cserver: &mut MsgChannel,
    version_file: &str,
    preproc_file: Option<&Path>,
    output: bool,
    creator: &mut T,
    cfg: &Config,
) -> Result<i32>
where
    T: CommandCreator,
{
    if !usecs.got_env {
        transfer_env(cserver, local_daemon, job, version_file)?;
    }

    if cserver.protocol() < PROTOCOL_VERSION_VERIFY_ENV && cfg.ignore_unverified {
        warn!("Host {} cannot be verified.", cserver.name);
        return Err(client_error(
            ErrorKind::Policy,
            26,
            format!("environment on {} cannot be verified", cserver.name),
        ));
    }

    debug!("send compile_file");
    cserver
        .send_msg(&Msg::CompileFile(job.clone()))
        .map_err(|_| {
            info!("write of job failed");
            client_error(ErrorKind::Protocol, 9, "error sending job to remote")
        })?;

    if job.streaming {
        debug!("sending stdin");
        let stdin = io::stdin();
        send_file_chunks(&mut stdin.lock(), cserver)?;
    } else if let Some(preproc) = preproc_file {
        let mut f = File::open(preproc).map_err(|_| {
            client_error(ErrorKind::LocalIo, 11, "unable to open preprocessed file")
        })?;
        send_file_chunks(&mut f, cserver)?;
    } else {
        let mut cpp = compiler::call_cpp(creator, job, Stdio::piped())
            .map_err(|_| client_error(ErrorKind::LocalIo, 18, "could not fork preprocessor"))?;
        let mut cpp_out = cpp
            .take_stdout()
            .ok_or_else(|| client_error(ErrorKind::LocalIo, 18, "preprocessor has no stdout"))?;

        if let Err(e) = send_file_chunks(&mut cpp_out, cserver) {
            let _ = cpp.kill();
            return Err(e);
        }
        drop(cpp_out);

        debug!("wait for cpp");
        let status = cpp.wait().context("failed to wait for preprocessor")?;
        let status = compiler::shell_exit_status(status);
        if status != 0 {
            // No remote compile will happen; hand the preprocessor's own
            // status back and let the channel close cleanly.
            return Ok(status);
        }
    }

    cserver.send_msg(&Msg::End).map_err(|_| {
        info!("write of end failed");
        client_error(ErrorKind::Protocol, 12, "failed to send end marker to remote")
    })?;

    debug!("wait for cs");
    let msg = cserver.get_msg(COMPILE_RESULT_TIMEOUT).map_err(|_| {
        client_error(ErrorKind::Protocol, 14, "error reading message from remote")
    })?;
    check_for_failure(&msg, cserver)?;

    let crmsg = match msg {
        Msg::CompileResult(c) => c,
        other => {
            warn!("waited for compile result, but got {}", other.tag());
            return Err(client_error(
                ErrorKind::Protocol,
                13,
                "did not get compile response message",
            ));
        }
    };

    let status = crmsg.status;

    if status != 0 && crmsg.was_out_of_memory {
        info!("the server ran out of memory, recompiling locally");
        return Err(remote_error(
            101,
            "the server ran out of memory, recompiling locally",
        ));
    }

    if output {
        if (!crmsg.out.is_empty() || !crmsg.err.is_empty())
            && compiler::output_needs_workaround(job)
        {
            info!("command needs stdout/stderr workaround, recompiling locally");
            return Err(remote_error(
                102,
                "command needs stdout/stderr workaround, recompiling locally",
            ));
        }

        let _ = io::stdout().write_all(crmsg.out.as_bytes());

        if compiler::colorify_wanted(cfg.color_diagnostics) {
            compiler::colorify_output(&crmsg.err);
        } else {
            let _ = io::stderr().write_all(crmsg.err.as_bytes());
        }

        if status != 0 && (!crmsg.err.is_empty() || !crmsg.out.is_empty()) {
            error!("Compiled on {}", cserver.name);
        }
    }

    if status == 0 {
        if job.streaming {
            let stdout = io::stdout();
            receive_chunks(&mut stdout.lock(), cserver)?;
        } else {
            receive_file(&job.output_file, cserver)?;
            if crmsg.have_dwo_file {
                receive_file(&job.dwo_file(), cserver)?;
            }
        }
    }

    Ok(status)
}

/// Ship the environment tarball, then ask the server to verify it when the
/// protocol allows. A negative verification blacklists the host with the
/// local daemon.
fn transfer_env(
    cserver: &mut MsgChannel,
    local_daemon: &mut MsgChannel,
    job: &CompileJob,
    version_file: &str,
) -> Result<()> {
    debug!(
        "transfer environment {} to {}",
        job.environment_version, cserver.name
    );

    fs::metadata(version_file)
        .map_err(|_| client_error(ErrorKind::LocalIo, 4, "unable to stat version file"))?;

    cserver
        .send_msg(&Msg::EnvTransfer(EnvTransfer {
            target_platform: job.target_platform.clone(),
            version: job.environment_version.clone(),
        }))
        .map_err(|_| {
            client_error(ErrorKind::Protocol, 6, "send environment to remote failed")
        })?;

    let mut env_fd = File::open(version_file).map_err(|_| {
        client_error(
            ErrorKind::LocalIo,
            5,
            format!("unable to open version file:\n\t{}", version_file),
        )
    })?;
    send_file_chunks(&mut env_fd, cserver)?;

    cserver.send_msg(&Msg::End).map_err(|_| {
        error!("write of environment failed");
        client_error(ErrorKind::Protocol, 8, "write environment to remote failed")
    })?;

    if cserver.protocol() >= PROTOCOL_VERSION_VERIFY_ENV {
        cserver
            .send_msg(&Msg::VerifyEnv(VerifyEnv {
                target_platform: job.target_platform.clone(),
                version: job.environment_version.clone(),
            }))
            .map_err(|_| client_error(ErrorKind::Protocol, 22, "error sending environment"))?;

        match cserver.get_msg(VERIFY_TIMEOUT) {
            Ok(Msg::VerifyEnvResult(res)) => {
                if !res.ok {
                    // The remote can't handle the environment at all (e.g.
                    // kernel too old); mark it as never to be used again for
                    // this environment.
                    info!(
                        "Host {} did not successfully verify environment.",
                        cserver.name
                    );
                    let _ = local_daemon.send_msg(&Msg::BlacklistHostEnv(BlacklistHostEnv {
                        target_platform: job.target_platform.clone(),
                        version: job.environment_version.clone(),
                        hostname: cserver.name.clone(),
                    }));
                    return Err(client_error(
                        ErrorKind::Verify,
                        24,
                        format!("remote {} unable to handle environment", cserver.name),
                    ));
                }
                trace!(
                    "Verified host {} for environment {} ({})",
                    cserver.name,
                    job.environment_version,
                    job.target_platform
                );
            }
            _ => {
                return Err(client_error(
                    ErrorKind::Protocol,
                    25,
                    "other error verifying environment on remote",
                ));
            }
        }
    }

    Ok(())
}

/// If the server unilaterally aborted, surface its fault report coherently
/// instead of whatever protocol error the abort would otherwise cause.
fn check_for_failure(msg: &Msg, cserver: &MsgChannel) -> Result<()> {
    if let Msg::StatusText(st) = msg {
        error!("Remote status (compiled on {}): {}", cserver.name, st.text);
        return Err(client_error(
            ErrorKind::Remote,
            23,
            format!("Remote status (compiled on {})\n{}", cserver.name, st.text),
        ));
    }
    Ok(())
}

/// Stream `src` to the server as a sequence of `FileChunk`s. The terminating
/// `End` is the caller's to send.
fn send_file_chunks<R: Read>(src: &mut R, cserver: &mut MsgChannel) -> Result<()> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut offset = 0;
    let mut uncompressed: u64 = 0;
    let wire_before = cserver.wire_sent();

    loop {
        let bytes = loop {
            match src.read(&mut buffer[offset..]) {
                Ok(n) => break n,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) => {
                    error!("reading local source: {}", e);
                    return Err(client_error(
                        ErrorKind::LocalIo,
                        16,
                        "error reading local cpp file",
                    ));
                }
            }
        };
        offset += bytes;

        if bytes == 0 || offset == buffer.len() {
            if offset > 0 {
                let chunk = Msg::FileChunk(FileChunk {
                    data: buffer[..offset].to_vec(),
                });
                if cserver.send_msg(&chunk).is_err() {
                    // A failed send often means the server gave up; fish for
                    // its parting words before reporting ours.
                    if let Ok(msg) = cserver.get_msg(STATUS_DRAIN_TIMEOUT) {
                        check_for_failure(&msg, cserver)?;
                    }
                    error!("write of source chunk to host {} failed", cserver.name);
                    return Err(client_error(
                        ErrorKind::Protocol,
                        15,
                        format!("write to host {} failed", cserver.name),
                    ));
                }
                uncompressed += offset as u64;
                offset = 0;
            }
            if bytes == 0 {
                break;
            }
        }
    }

    let compressed = cserver.wire_sent() - wire_before;
    if uncompressed > 0 {
        trace!(
            "sent {} bytes ({}%)",
            compressed,
            compressed * 100 / uncompressed
        );
    }
    Ok(())
}

/// Receive a `FileChunk`/`End` stream into `dst`.
fn receive_chunks<W: Write>(dst: &mut W, cserver: &mut MsgChannel) -> Result<()> {
    let mut uncompressed: u64 = 0;
    let wire_before = cserver.wire_received();

    loop {
        let msg = cserver.get_msg(CHUNK_RECV_TIMEOUT).map_err(|_| {
            // the network went down?
            client_error(ErrorKind::Protocol, 19, "connection lost (network failure?)")
        })?;
        check_for_failure(&msg, cserver)?;

        match msg {
            Msg::End => break,
            Msg::FileChunk(chunk) => {
                dst.write_all(&chunk.data)
                    .map_err(|_| client_error(ErrorKind::LocalIo, 21, "error writing file"))?;
                uncompressed += chunk.data.len() as u64;
            }
            other => {
                return Err(client_error(
                    ErrorKind::Protocol,
                    20,
                    format!("unexpected message {}", other.tag()),
                ));
            }
        }
    }

    let compressed = cserver.wire_received() - wire_before;
    if uncompressed > 0 {
        trace!(
            "got {} bytes ({}%)",
            compressed,
            compressed * 100 / uncompressed
        );
    }
    Ok(())
}

/// Receive an artifact into `<output_file>_icetmp`, then atomically rename
/// into place. Any failure leaves `output_file` untouched.
fn receive_file(output_file: &str, cserver: &mut MsgChannel) -> Result<()> {
    let tmp_file = format!("{}_icetmp", output_file);
    let mut obj = File::create(&tmp_file).map_err(|e| {
        client_error(
            ErrorKind::LocalIo,
            31,
            format!("can't create {}: {}", tmp_file, e),
        )
    })?;

    if let Err(e) = receive_chunks(&mut obj, cserver) {
        let _ = fs::remove_file(&tmp_file);
        return Err(e);
    }

    if obj.sync_all().is_err() || fs::rename(&tmp_file, output_file).is_err() {
        let _ = fs::remove_file(&tmp_file);
        return Err(client_error(
            ErrorKind::LocalIo,
            30,
            "error finalizing received file",
        ));
    }
    Ok(())
}

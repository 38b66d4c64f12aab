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

//! Top-level remote build orchestration: request assignments from the local
//! daemon, dispatch one session per assignment (three in parallel when the
//! redundancy gate fires), and cross-check the results.

mod fallback;
mod session;

pub use fallback::maybe_build_local;
pub use session::build_remote_int;

use crate::client::MsgChannel;
use crate::compiler::{self, CompileJob};
use crate::config::Config;
use crate::envs::{rip_out_paths, Environments, ResolvedEnvironments};
use crate::errors::*;
use crate::mock_command::{CommandChild, CommandCreator};
use crate::protocol::{GetCs, Msg, UseCs, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION_VERIFY_ENV};
use crate::util::{file_digest, get_absfilename};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

/// How long the scheduler gets to come up with an assignment.
const SCHEDULER_REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(4 * 60);

/// How many replicas a promoted compile runs.
const REDUNDANCY: u32 = 3;

/// Minimal version of remote host that we want to use for the job.
fn minimal_remote_version(cfg: &Config) -> u32 {
    if cfg.ignore_unverified {
        MIN_PROTOCOL_VERSION.max(PROTOCOL_VERSION_VERIFY_ENV)
    } else {
        MIN_PROTOCOL_VERSION
    }
}

fn get_server(local_daemon: &mut MsgChannel) -> Result<UseCs> {
    match local_daemon.get_msg(SCHEDULER_REPLY_TIMEOUT) {
        Ok(Msg::UseCs(usecs)) => Ok(usecs),
        reply => {
            warn!(
                "replied not with use_cs: {}",
                reply.as_ref().map(|m| m.tag()).unwrap_or("nothing")
            );
            Err(client_error(
                ErrorKind::Protocol,
                1,
                "expected use_cs reply, but got something else",
            ))
        }
    }
}

/// The scheduler matches repeated compilations of one unit by this key.
fn fake_filename(job: &CompileJob) -> String {
    let mut key = String::new();
    for flag in job.remote_flags.iter().chain(job.rest_flags.iter()) {
        key.push('/');
        key.push_str(flag);
    }
    key.push_str(&get_absfilename(&job.input_file));
    key
}

fn get_cs_msg(
    job: &CompileJob,
    resolved: &ResolvedEnvironments,
    filename: String,
    count: u32,
    cfg: &Config,
) -> Msg {
    Msg::GetCs(GetCs {
        versions: resolved.versions.clone(),
        filename,
        lang: job.language,
        count,
        target_platform: job.target_platform.clone(),
        arg_flags: job.argument_flags.clone(),
        preferred_host: cfg.preferred_host.clone().unwrap_or_default(),
        min_protocol: minimal_remote_version(cfg),
    })
}

/// Compile `job` remotely and return the compiler's exit status.
///
/// `permill` is the probability per mille that this invocation is promoted
/// to a triple build whose object files are compared bit for bit.
pub fn build_remote<T>(
    job: &mut CompileJob,
    local_daemon: &mut MsgChannel,
    envs: &Environments,
    permill: u32,
    creator: &mut T,
    cfg: &Config,
) -> Result<i32>
where
    T: CommandCreator,
{
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .wrapping_add(u64::from(std::process::id()));
    let mut rng = StdRng::seed_from_u64(seed);

    let mut torepeat = 1;
    // Streaming jobs cannot be replayed, and clang cannot be made
    // bit-reproducible across hosts.
    if !compiler::compiler_is_clang(job)
        && !job.streaming
        && rng.gen_range(0..1000) < permill
    {
        torepeat = REDUNDANCY;
    }

    trace!(
        "{} compiled {} times on {}",
        job.input_file,
        torepeat,
        job.target_platform
    );

    let resolved = rip_out_paths(envs);
    if resolved.versions.is_empty() {
        error!("$ICECC_VERSION needs to point to .tar files");
        return Err(client_error(
            ErrorKind::Config,
            22,
            "$ICECC_VERSION needs to point to .tar files",
        ));
    }

    if torepeat == 1 {
        build_single(job, local_daemon, &resolved, creator, cfg)
    } else {
        build_redundant(job, local_daemon, &resolved, torepeat, &mut rng, creator, cfg)
    }
}

fn build_single<T>(
    job: &mut CompileJob,
    local_daemon: &mut MsgChannel,
    resolved: &ResolvedEnvironments,
    creator: &mut T,
    cfg: &Config,
) -> Result<i32>
where
    T: CommandCreator,
{
    let getcs = get_cs_msg(job, resolved, fake_filename(job), 1, cfg);
    local_daemon.send_msg(&getcs).map_err(|_| {
        warn!("asked for CS");
        client_error(ErrorKind::Protocol, 24, "asked for CS")
    })?;

    let usecs = get_server(local_daemon)?;
    if let Some(ret) = maybe_build_local(local_daemon, &usecs, job, creator, cfg)? {
        return Ok(ret);
    }

    let environment = resolved
        .version_map
        .get(&usecs.host_platform)
        .cloned()
        .unwrap_or_default();
    let version_file = resolved
        .versionfile_map
        .get(&usecs.host_platform)
        .cloned()
        .unwrap_or_default();
    build_remote_int(
        job,
        &usecs,
        local_daemon,
        &environment,
        &version_file,
        None,
        true,
        creator,
        cfg,
    )
}

fn make_tmp_path(suffix: &str) -> Result<PathBuf> {
    let (file, path) = tempfile::Builder::new()
        .prefix("icecc")
        .suffix(suffix)
        .tempfile()?
        .keep()
        .map_err(|e| anyhow!("cannot keep temp file: {}", e))?;
    drop(file);
    Ok(path)
}

fn remove_artifacts(job: &CompileJob, has_split_dwarf: bool) {
    let _ = fs::remove_file(&job.output_file);
    if has_split_dwarf {
        let _ = fs::remove_file(job.dwo_file());
    }
}

fn build_redundant<T>(
    job: &mut CompileJob,
    local_daemon: &mut MsgChannel,
    resolved: &ResolvedEnvironments,
    torepeat: u32,
    rng: &mut StdRng,
    creator: &mut T,
    cfg: &Config,
) -> Result<i32>
where
    T: CommandCreator,
{
    let has_split_dwarf = job.dwarf_fission;

    // Preprocess once, here; every replica ships the same bytes.
    let preproc = make_tmp_path(".ix")?;
    let preproc_file = fs::File::create(&preproc)?;
    let cpp_pid = compiler::call_cpp(creator, job, Stdio::from(preproc_file));
    let mut cpp = match cpp_pid {
        Ok(child) => child,
        Err(_) => {
            let _ = fs::remove_file(&preproc);
            return Err(client_error(
                ErrorKind::LocalIo,
                10,
                "unable to fork preprocessor",
            ));
        }
    };
    let status = match cpp.wait() {
        Ok(status) => compiler::shell_exit_status(status),
        Err(e) => {
            let _ = fs::remove_file(&preproc);
            return Err(Error::new(e).context("failed to wait for preprocessor"));
        }
    };
    if status != 0 {
        let _ = fs::remove_file(&preproc);
        return Ok(status);
    }

    // All replicas must produce identical symbol names despite sitting on
    // different hosts.
    job.remote_flags
        .push(format!("-frandom-seed={}", rng.gen::<u32>()));

    let getcs = get_cs_msg(
        job,
        resolved,
        get_absfilename(&job.input_file),
        torepeat,
        cfg,
    );
    if local_daemon.send_msg(&getcs).is_err() {
        warn!("asked for CS");
        let _ = fs::remove_file(&preproc);
        return Err(client_error(ErrorKind::Protocol, 0, "asked for CS"));
    }

    let mut jobs: Vec<CompileJob> = Vec::with_capacity(torepeat as usize);
    let mut umsgs: Vec<UseCs> = Vec::with_capacity(torepeat as usize);
    let mut jobmap: HashMap<Pid, usize> = HashMap::new();
    let mut exit_codes = vec![42; torepeat as usize];
    let mut spawn_error = None;

    for i in 0..torepeat as usize {
        let mut replica = job.clone();
        if i > 0 {
            let tmp_out = match make_tmp_path(".o") {
                Ok(p) => p,
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            };
            replica.output_file = tmp_out.to_string_lossy().into_owned();
        }

        let usecs = match get_server(local_daemon) {
            Ok(u) => u,
            Err(e) => {
                spawn_error = Some(e);
                jobs.push(replica);
                break;
            }
        };
        trace!("got_server_for_job {}", usecs.hostname);

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                jobmap.insert(child, i);
            }
            Ok(ForkResult::Child) => {
                let ret = run_replica(
                    &mut replica,
                    &usecs,
                    local_daemon,
                    resolved,
                    &preproc,
                    i == 0,
                    creator,
                    cfg,
                );
                unsafe { libc::_exit(ret) }
            }
            Err(e) => {
                spawn_error = Some(Error::new(e).context("fork failed"));
                jobs.push(replica);
                umsgs.push(usecs);
                break;
            }
        }

        jobs.push(replica);
        umsgs.push(usecs);
    }

    let mut misc_error = false;
    for _ in 0..jobmap.len() {
        match wait() {
            Ok(WaitStatus::Exited(pid, code)) => {
                if let Some(&idx) = jobmap.get(&pid) {
                    exit_codes[idx] = code;
                }
            }
            Ok(WaitStatus::Signaled(..)) => {
                // there was some misc error in processing
                misc_error = true;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("wait failed: {}", e);
                misc_error = true;
                break;
            }
        }
    }

    let final_status = if spawn_error.is_none() && !misc_error {
        compare_outputs(&jobs, &umsgs, &exit_codes, &preproc, has_split_dwarf)
    } else {
        exit_codes[0]
    };

    // Temp hygiene: whatever the outcome, per-replica artifacts and the
    // shared preprocessed input must not outlive this call. A `.caught`
    // rename in the compare phase has already moved the forensic copies
    // aside.
    for replica in jobs.iter().skip(1) {
        remove_artifacts(replica, has_split_dwarf);
    }
    if misc_error || spawn_error.is_some() {
        if let Some(first) = jobs.first() {
            remove_artifacts(first, has_split_dwarf);
        }
    }
    let _ = fs::remove_file(&preproc);

    if let Some(e) = spawn_error {
        return Err(e);
    }
    if misc_error {
        return Err(client_error(ErrorKind::Orchestrator, 27, "misc error"));
    }
    Ok(final_status)
}

/// One forked replica: local fallback or a full remote session. A session
/// failure in a replica must not fail the build; the child signals itself so
/// the parent sees a signaled status and flags the replica.
#[allow(clippy::too_many_arguments)]
fn run_replica<T>(
    job: &mut CompileJob,
    usecs: &UseCs,
    local_daemon: &mut MsgChannel,
    resolved: &ResolvedEnvironments,
    preproc: &Path,
    emit_output: bool,
    creator: &mut T,
    cfg: &Config,
) -> i32
where
    T: CommandCreator,
{
    let result = maybe_build_local(local_daemon, usecs, job, creator, cfg).and_then(|local| {
        match local {
            Some(ret) => Ok(ret),
            None => {
                let environment = resolved
                    .version_map
                    .get(&usecs.host_platform)
                    .cloned()
                    .unwrap_or_default();
                let version_file = resolved
                    .versionfile_map
                    .get(&usecs.host_platform)
                    .cloned()
                    .unwrap_or_default();
                build_remote_int(
                    job,
                    usecs,
                    local_daemon,
                    &environment,
                    &version_file,
                    Some(preproc),
                    emit_output,
                    creator,
                    cfg,
                )
            }
        }
    });

    match result {
        Ok(ret) => ret,
        Err(e) => {
            info!("build_remote_int failed and has thrown {}", e);
            let _ = kill(Pid::this(), Signal::SIGTERM);
            0 // shouldn't matter
        }
    }
}

/// Cross-check replica outputs against replica 0. Returns the final status:
/// replica 0's exit code, or -1 after a mismatch. Matching replicas have
/// their temp artifacts deleted; a digest mismatch moves replica 0's
/// artifacts and the preprocessed input aside as `.caught` files.
fn compare_outputs(
    jobs: &[CompileJob],
    umsgs: &[UseCs],
    exit_codes: &[i32],
    preproc: &Path,
    has_split_dwarf: bool,
) -> i32 {
    let mut status = exit_codes[0];
    let first_digest = file_digest(&jobs[0].output_file);

    for i in 1..jobs.len() {
        if exit_codes[0] == 0 {
            if exit_codes[i] == 42 {
                // they are free to fail for misc reasons
                continue;
            }

            if exit_codes[i] != 0 {
                error!(
                    "{} compiled with exit code {} and {} compiled with exit code {} - aborting!",
                    umsgs[i].hostname, exit_codes[i], umsgs[0].hostname, exit_codes[0]
                );
                remove_artifacts(&jobs[0], has_split_dwarf);
                status = -1;
                break;
            }

            let other_digest = file_digest(&jobs[i].output_file);
            if first_digest.is_empty() || other_digest != first_digest {
                error!(
                    "{} compiled {} with md5 sum {}({}) and {} compiled with md5 sum {} - aborting!",
                    umsgs[i].hostname,
                    jobs[0].output_file,
                    other_digest,
                    jobs[i].output_file,
                    umsgs[0].hostname,
                    first_digest
                );
                let _ = fs::rename(
                    &jobs[0].output_file,
                    format!("{}.caught", jobs[0].output_file),
                );
                let _ = fs::rename(preproc, format!("{}.caught", preproc.display()));
                if has_split_dwarf {
                    let dwo = jobs[0].dwo_file();
                    let _ = fs::rename(&dwo, format!("{}.caught", dwo));
                }
                status = -1;
                break;
            }
        }

        remove_artifacts(&jobs[i], has_split_dwarf);
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_command::{exit_status, MockChild, MockCommandCreator};
    use crate::protocol::PROTOCOL_VERSION;
    use crate::test::utils::{connect_to, mock_peer, write_fake_tarball};
    use std::ffi::{OsStr, OsString};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_job(args: &[&str]) -> CompileJob {
        let args: Vec<OsString> = args.iter().map(OsString::from).collect();
        CompileJob::analyze(OsStr::new("gcc"), &args, Path::new("/build"), "x86_64").unwrap()
    }

    fn resolved_for(dir: &Path) -> (Environments, ResolvedEnvironments) {
        let tarball = write_fake_tarball(dir, "gcc-13.tar.gz");
        let envs: Environments = vec![("x86_64".to_owned(), tarball)];
        let resolved = rip_out_paths(&envs);
        (envs, resolved)
    }

    fn use_cs(i: u32, hostname: &str) -> UseCs {
        UseCs {
            hostname: hostname.into(),
            port: 10245,
            job_id: i,
            host_platform: "x86_64".into(),
            got_env: true,
            matched_job_id: 0,
        }
    }

    #[test]
    fn test_minimal_remote_version_strict_mode() {
        let mut cfg = Config::default();
        assert_eq!(minimal_remote_version(&cfg), MIN_PROTOCOL_VERSION);
        cfg.ignore_unverified = true;
        assert_eq!(minimal_remote_version(&cfg), PROTOCOL_VERSION_VERIFY_ENV);
    }

    #[test]
    fn test_fake_filename_concatenates_flags_and_path() {
        let job = test_job(&["-c", "foo.c", "-O2", "-DBAR"]);
        assert_eq!(fake_filename(&job), "/-c/-O2/-DBAR/build/foo.c");
    }

    #[test]
    fn test_get_server_wrong_reply() {
        let (port, peer) = mock_peer(PROTOCOL_VERSION, |chan| {
            chan.send_msg(&Msg::End).unwrap();
        });
        let mut daemon = connect_to(port);
        let err = get_server(&mut daemon).unwrap_err();
        peer.join().unwrap();
        assert_eq!(err.downcast_ref::<ClientError>().unwrap().code, 1);
    }

    #[test]
    fn test_build_remote_requires_tar_environments() {
        let (port, peer) = mock_peer(PROTOCOL_VERSION, |_chan| {});
        let mut daemon = connect_to(port);
        let envs: Environments = vec![("x86_64".to_owned(), "/tmp/not-an-archive.zip".into())];
        let mut job = test_job(&["-c", "foo.c"]);
        let mut creator = MockCommandCreator::new();
        let err = build_remote(
            &mut job,
            &mut daemon,
            &envs,
            0,
            &mut creator,
            &Config::default(),
        )
        .unwrap_err();
        drop(daemon);
        peer.join().unwrap();
        assert_eq!(err.downcast_ref::<ClientError>().unwrap().code, 22);
    }

    /// The single-replica path through the loopback fallback: GetCs with one
    /// assignment requested, then the job announced and JobDone reported.
    #[test]
    fn test_build_remote_single_loopback() {
        let dir = tempdir().unwrap();
        let (envs, _) = resolved_for(dir.path());

        let (port, peer) = mock_peer(PROTOCOL_VERSION, |chan| {
            let getcs = match chan.get_msg(Duration::from_secs(5)).unwrap() {
                Msg::GetCs(g) => g,
                other => panic!("unexpected {}", other.tag()),
            };
            chan.send_msg(&Msg::UseCs(UseCs {
                hostname: "127.0.0.1".into(),
                port: 0,
                job_id: 11,
                host_platform: "x86_64".into(),
                got_env: false,
                matched_job_id: 0,
            }))
            .unwrap();
            let mut msgs = vec![];
            while let Ok(msg) = chan.get_msg(Duration::from_secs(5)) {
                msgs.push(msg);
            }
            (getcs, msgs)
        });
        let mut daemon = connect_to(port);

        let mut job = test_job(&["-c", "foo.c", "-O2"]);
        let mut creator = MockCommandCreator::new();
        creator.next_command_spawns(Ok(MockChild::new(exit_status(0), "", "")));
        let ret = build_remote(
            &mut job,
            &mut daemon,
            &envs,
            0,
            &mut creator,
            &Config::default(),
        )
        .unwrap();
        assert_eq!(ret, 0);

        drop(daemon);
        let (getcs, msgs) = peer.join().unwrap();
        assert_eq!(getcs.count, 1);
        assert_eq!(getcs.versions, vec![("x86_64".to_owned(), "gcc-13".to_owned())]);
        assert!(getcs.filename.contains("/-O2"));
        assert!(getcs.filename.ends_with("/build/foo.c"));
        assert_eq!(getcs.min_protocol, MIN_PROTOCOL_VERSION);
        assert!(matches!(msgs[0], Msg::CompileFile(_)));
        assert!(matches!(msgs[1], Msg::JobDone(_)));
    }

    fn compare_fixture(dir: &Path, contents: &[&[u8]]) -> (Vec<CompileJob>, Vec<UseCs>) {
        let mut jobs = vec![];
        let mut umsgs = vec![];
        for (i, content) in contents.iter().enumerate() {
            let out = dir.join(format!("replica{}.o", i));
            fs::write(&out, content).unwrap();
            let mut job = test_job(&["-c", "foo.c"]);
            job.output_file = out.to_string_lossy().into_owned();
            jobs.push(job);
            umsgs.push(use_cs(i as u32, &format!("host{}", i)));
        }
        (jobs, umsgs)
    }

    /// Redundant match: replicas agree, their temp objects vanish, replica
    /// 0's artifact survives untouched.
    #[test]
    fn test_compare_outputs_match() {
        let dir = tempdir().unwrap();
        let obj = vec![0xAB; 1024];
        let (jobs, umsgs) = compare_fixture(dir.path(), &[&obj, &obj, &obj]);
        let preproc = dir.path().join("foo.ix");
        fs::write(&preproc, b"src").unwrap();

        let status = compare_outputs(&jobs, &umsgs, &[0, 0, 0], &preproc, false);
        assert_eq!(status, 0);
        assert!(Path::new(&jobs[0].output_file).exists());
        assert!(!Path::new(&jobs[1].output_file).exists());
        assert!(!Path::new(&jobs[2].output_file).exists());
        assert!(!dir.path().join("replica0.o.caught").exists());
    }

    /// Redundant mismatch: one byte differs, the build aborts with -1 and
    /// the forensic `.caught` files replace the originals.
    #[test]
    fn test_compare_outputs_digest_mismatch() {
        let dir = tempdir().unwrap();
        let obj = vec![0xAB; 1024];
        let mut other = obj.clone();
        other[512] ^= 1;
        let (jobs, umsgs) = compare_fixture(dir.path(), &[&obj, &obj, &other]);
        let preproc = dir.path().join("foo.ix");
        fs::write(&preproc, b"src").unwrap();

        let status = compare_outputs(&jobs, &umsgs, &[0, 0, 0], &preproc, false);
        assert_eq!(status, -1);
        assert!(!Path::new(&jobs[0].output_file).exists());
        assert!(dir.path().join("replica0.o.caught").exists());
        assert!(!preproc.exists());
        assert!(dir.path().join("foo.ix.caught").exists());
        // The matching replica was cleaned before the mismatch was seen.
        assert!(!Path::new(&jobs[1].output_file).exists());
    }

    /// A replica failing where replica 0 succeeded aborts the build and
    /// deletes replica 0's artifact.
    #[test]
    fn test_compare_outputs_status_mismatch() {
        let dir = tempdir().unwrap();
        let obj = vec![0xAB; 64];
        let (jobs, umsgs) = compare_fixture(dir.path(), &[&obj, &obj]);
        let preproc = dir.path().join("foo.ix");
        fs::write(&preproc, b"src").unwrap();

        let status = compare_outputs(&jobs, &umsgs, &[0, 1], &preproc, false);
        assert_eq!(status, -1);
        assert!(!Path::new(&jobs[0].output_file).exists());
        assert!(!dir.path().join("replica0.o.caught").exists());
    }

    /// Exit code 42 marks a replica that failed for miscellaneous
    /// acceptable reasons; it neither aborts nor compares.
    #[test]
    fn test_compare_outputs_skips_code_42() {
        let dir = tempdir().unwrap();
        let obj = vec![0xAB; 64];
        let (jobs, umsgs) = compare_fixture(dir.path(), &[&obj, &obj]);
        let preproc = dir.path().join("foo.ix");
        fs::write(&preproc, b"src").unwrap();

        let status = compare_outputs(&jobs, &umsgs, &[0, 42], &preproc, false);
        assert_eq!(status, 0);
        assert!(Path::new(&jobs[0].output_file).exists());
    }

    /// If replica 0 itself failed, its status stands and nothing is
    /// compared.
    #[test]
    fn test_compare_outputs_first_failed() {
        let dir = tempdir().unwrap();
        let obj = vec![0xAB; 64];
        let (jobs, umsgs) = compare_fixture(dir.path(), &[&obj, &obj]);
        let preproc = dir.path().join("foo.ix");
        fs::write(&preproc, b"src").unwrap();

        let status = compare_outputs(&jobs, &umsgs, &[4, 0], &preproc, false);
        assert_eq!(status, 4);
        assert!(!Path::new(&jobs[1].output_file).exists());
    }
}

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

//! When the scheduler assigns the job back to the submitter, skip the wire
//! and run the compiler here, reporting statistics so the daemon can play
//! proxy for us.

use crate::client::MsgChannel;
use crate::compiler::{self, CompileJob};
use crate::config::Config;
use crate::errors::*;
use crate::mock_command::CommandCreator;
use crate::protocol::{JobDone, Msg, UseCs};
use crate::util::fmt_duration_as_secs;
use std::time::Instant;

/// Accumulated resource usage of reaped children, the parts `JobDone` wants.
#[derive(Debug, Clone, Copy)]
struct ChildUsage {
    user_msec: u32,
    sys_msec: u32,
    pfaults: u32,
}

fn children_usage() -> ChildUsage {
    let mut ru = unsafe { std::mem::zeroed::<libc::rusage>() };
    unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut ru) };
    ChildUsage {
        user_msec: (ru.ru_utime.tv_sec * 1000 + ru.ru_utime.tv_usec / 1000) as u32,
        sys_msec: (ru.ru_stime.tv_sec * 1000 + ru.ru_stime.tv_usec / 1000) as u32,
        pfaults: (ru.ru_majflt + ru.ru_minflt + ru.ru_nswap) as u32,
    }
}

/// If `usecs` routes the job back to this host, build locally and report
/// `JobDone` statistics to the daemon. Returns the local exit code, or
/// `None` when a real remote session should run.
///
/// With `ICECC_TEST_REMOTEBUILD` set and a nonzero port the shortcut is
/// disabled, so test setups can exercise the remote path against a daemon on
/// this very machine.
pub fn maybe_build_local<T>(
    local_daemon: &mut MsgChannel,
    usecs: &UseCs,
    job: &mut CompileJob,
    creator: &mut T,
    cfg: &Config,
) -> Result<Option<i32>>
where
    T: CommandCreator,
{
    if usecs.hostname != "127.0.0.1" {
        return Ok(None);
    }
    if cfg.test_remotebuild && usecs.port != 0 {
        return Ok(None);
    }

    trace!("building myself, but telling localhost");
    job.job_id = usecs.job_id;
    job.environment_version = "__client".to_owned();

    local_daemon
        .send_msg(&Msg::CompileFile(job.clone()))
        .map_err(|_| {
            info!("write of job failed");
            client_error(ErrorKind::LocalIo, 29, "write of job failed")
        })?;

    let begin = Instant::now();
    let usage_before = children_usage();

    let ret = compiler::build_local(creator, job)?;

    let real = begin.elapsed();
    let usage_after = children_usage();
    trace!("built locally in {}", fmt_duration_as_secs(&real));

    let mut out_uncompressed = 0;
    if let Ok(md) = std::fs::metadata(&job.output_file) {
        out_uncompressed += md.len();
    }
    if let Ok(md) = std::fs::metadata(job.dwo_file()) {
        out_uncompressed += md.len();
    }

    let done = JobDone {
        job_id: job.job_id,
        exitcode: ret,
        from_submitter: true,
        real_msec: real.as_millis() as u32,
        user_msec: usage_after.user_msec.saturating_sub(usage_before.user_msec),
        sys_msec: usage_after.sys_msec.saturating_sub(usage_before.sys_msec),
        pfaults: usage_after.pfaults.saturating_sub(usage_before.pfaults),
        out_uncompressed,
    };

    if done.user_msec > 50 && done.out_uncompressed > 1024 {
        trace!(
            "speed={}",
            done.out_uncompressed as f64 / done.user_msec as f64
        );
    }

    if local_daemon.send_msg(&Msg::JobDone(done)).is_err() {
        warn!("failed to report job statistics to the local daemon");
    }

    Ok(Some(ret))
}

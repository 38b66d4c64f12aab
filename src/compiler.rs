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

use crate::errors::*;
use crate::mock_command::{CommandChild, CommandCreator, RunCommand};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

/// Source language of a compilation, as far as the scheduler cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    C,
    Cxx,
    ObjC,
    Custom,
}

/// How to color diagnostics written back to the user's terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Off,
    Auto,
    On,
}

/// One compilation as submitted by the user.
///
/// The argument flags are partitioned: `rest_flags` is what the local
/// preprocessor consumes (`-I`, `-D`, ...), `remote_flags` is what the remote
/// compiler runs with, and `argument_flags` is the shape subset (`-O*`,
/// `-g*`) the scheduler uses to match repeated compilations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompileJob {
    /// Assigned by the scheduler once a server is picked.
    pub job_id: u32,
    pub language: Language,
    pub compiler_name: String,
    pub input_file: String,
    pub output_file: String,
    pub target_platform: String,
    pub argument_flags: Vec<String>,
    pub remote_flags: Vec<String>,
    pub rest_flags: Vec<String>,
    /// Source arrives on stdin and the object leaves on stdout.
    pub streaming: bool,
    /// `-gsplit-dwarf`: the compile emits a `.dwo` companion.
    pub dwarf_fission: bool,
    /// Assigned during remote dispatch.
    pub environment_version: String,
}

impl CompileJob {
    /// Build a job from a compiler command line.
    ///
    /// This is deliberately shallow; the driver only needs the input/output
    /// paths, the language, and the flag partition. Anything it does not
    /// recognize is passed to the remote compiler untouched.
    pub fn analyze(
        exe: &OsStr,
        cmdline: &[OsString],
        cwd: &Path,
        target_platform: &str,
    ) -> Result<CompileJob> {
        let compiler_name = Path::new(exe)
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| anyhow!("bad compiler name {:?}", exe))?
            .to_owned();

        let mut input_file = String::new();
        let mut output_file = String::new();
        let mut language = None;
        let mut argument_flags = vec![];
        let mut remote_flags = vec![];
        let mut rest_flags = vec![];
        let mut dwarf_fission = false;

        let mut args = cmdline.iter().map(|a| a.to_string_lossy().into_owned());
        while let Some(arg) = args.next() {
            if arg == "-o" {
                output_file = args.next().unwrap_or_default();
            } else if let Some(lang) = source_language(&arg) {
                language = Some(lang);
                input_file = arg;
            } else if arg == "-" {
                input_file = arg;
            } else if is_preprocessor_flag(&arg) {
                if arg == "-include" || arg == "-isystem" || arg == "-I" {
                    // These take a separate value argument.
                    rest_flags.push(arg);
                    if let Some(value) = args.next() {
                        rest_flags.push(value);
                    }
                } else {
                    rest_flags.push(arg);
                }
            } else {
                if arg == "-gsplit-dwarf" {
                    dwarf_fission = true;
                }
                if arg.starts_with("-O") || arg.starts_with("-g") {
                    argument_flags.push(arg.clone());
                }
                remote_flags.push(arg);
            }
        }

        if input_file.is_empty() {
            bail!("no input file in compile command");
        }
        let streaming = input_file == "-";
        if output_file.is_empty() && !streaming {
            output_file = default_output_file(&input_file);
        }
        Ok(CompileJob {
            job_id: 0,
            language: language.unwrap_or(Language::Custom),
            compiler_name,
            input_file: if streaming {
                input_file
            } else {
                cwd.join(&input_file).to_string_lossy().into_owned()
            },
            output_file,
            target_platform: target_platform.to_owned(),
            argument_flags,
            remote_flags,
            rest_flags,
            streaming,
            dwarf_fission,
            environment_version: String::new(),
        })
    }

    /// The `.dwo` sibling of the output file: last extension replaced.
    pub fn dwo_file(&self) -> String {
        match self.output_file.rfind('.') {
            Some(idx) => format!("{}.dwo", &self.output_file[..idx]),
            None => format!("{}.dwo", self.output_file),
        }
    }
}

fn source_language(arg: &str) -> Option<Language> {
    let ext = Path::new(arg).extension()?.to_str()?;
    match ext {
        "c" => Some(Language::C),
        "cc" | "cpp" | "cxx" | "C" => Some(Language::Cxx),
        "m" | "mm" => Some(Language::ObjC),
        _ => None,
    }
}

fn is_preprocessor_flag(arg: &str) -> bool {
    arg == "-include"
        || arg == "-isystem"
        || ["-I", "-D", "-U"].iter().any(|p| arg.starts_with(p))
}

fn default_output_file(input: &str) -> String {
    let p = PathBuf::from(input);
    p.with_extension("o")
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// True for clang-family compilers, which cannot be made bit-reproducible
/// across hosts the way the redundancy check needs.
pub fn compiler_is_clang(job: &CompileJob) -> bool {
    job.compiler_name.contains("clang")
}

/// Fork the local preprocessor for `job`, stdout redirected to `output`.
///
/// The returned child's stdout carries the preprocessed source when `output`
/// is a pipe.
pub fn call_cpp<T>(
    creator: &mut T,
    job: &CompileJob,
    output: Stdio,
) -> io::Result<<T::Cmd as RunCommand>::C>
where
    T: CommandCreator,
{
    let mut cmd = creator.new_command(&job.compiler_name);
    cmd.args(&job.rest_flags);
    cmd.arg("-E");
    cmd.arg(&job.input_file);
    cmd.stdout(output);
    trace!("call_cpp: {} -E {}", job.compiler_name, job.input_file);
    cmd.spawn()
}

/// Run the compile on this host with the job's full flag set.
pub fn build_local<T>(creator: &mut T, job: &CompileJob) -> Result<i32>
where
    T: CommandCreator,
{
    let mut cmd = creator.new_command(&job.compiler_name);
    cmd.args(&job.rest_flags);
    cmd.args(&job.remote_flags);
    if !job.output_file.is_empty() {
        cmd.arg("-o");
        cmd.arg(&job.output_file);
    }
    cmd.arg(&job.input_file);
    trace!("build_local: {} {}", job.compiler_name, job.input_file);
    let mut child = cmd.spawn().context("failed to spawn local compiler")?;
    let status = child.wait().context("failed to wait for local compiler")?;
    Ok(shell_exit_status(status))
}

/// Collapse an `ExitStatus` to the shell convention: the exit code, or
/// 128 + N for death by signal N.
pub fn shell_exit_status(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    status.code().unwrap_or(-1)
}

/// Whether captured remote stdout/stderr cannot simply be replayed and the
/// compile must be redone locally: gcc run on the preprocessed temp makes
/// its diagnostics reference that temp when `-fdirectives-only` is in play.
pub fn output_needs_workaround(job: &CompileJob) -> bool {
    !compiler_is_clang(job) && job.remote_flags.iter().any(|f| f == "-fdirectives-only")
}

pub fn colorify_wanted(mode: ColorMode) -> bool {
    match mode {
        ColorMode::On => true,
        ColorMode::Off => false,
        ColorMode::Auto => io::stderr().is_terminal(),
    }
}

/// Re-colorize compiler stderr that lost its color on the remote pipe.
pub fn colorify_output(err: &str) {
    let stderr = io::stderr();
    let mut handle = stderr.lock();
    for line in err.split_inclusive('\n') {
        let colored = if line.contains(" error:") || line.contains(" fatal error:") {
            format!("\x1b[1;31m{}\x1b[0m", line.trim_end_matches('\n'))
        } else if line.contains(" warning:") {
            format!("\x1b[1;35m{}\x1b[0m", line.trim_end_matches('\n'))
        } else {
            line.trim_end_matches('\n').to_owned()
        };
        let nl = if line.ends_with('\n') { "\n" } else { "" };
        let _ = write!(handle, "{}{}", colored, nl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_command::{exit_status, MockChild, MockCommandCreator};

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    fn analyze(args: &[&str]) -> CompileJob {
        CompileJob::analyze(
            OsStr::new("gcc"),
            &os(args),
            Path::new("/build"),
            "x86_64",
        )
        .unwrap()
    }

    #[test]
    fn test_analyze_basic() {
        let job = analyze(&["-c", "foo.c", "-o", "foo.o", "-O2", "-DBAR", "-Iinc"]);
        assert_eq!(job.language, Language::C);
        assert_eq!(job.input_file, "/build/foo.c");
        assert_eq!(job.output_file, "foo.o");
        assert_eq!(job.remote_flags, vec!["-c", "-O2"]);
        assert_eq!(job.rest_flags, vec!["-DBAR", "-Iinc"]);
        assert_eq!(job.argument_flags, vec!["-O2"]);
        assert!(!job.streaming);
        assert!(!job.dwarf_fission);
    }

    #[test]
    fn test_analyze_split_dwarf_and_cxx() {
        let job = analyze(&["-c", "foo.cpp", "-gsplit-dwarf"]);
        assert_eq!(job.language, Language::Cxx);
        assert!(job.dwarf_fission);
        assert_eq!(job.output_file, "foo.o");
        assert!(job.argument_flags.contains(&"-gsplit-dwarf".to_owned()));
    }

    #[test]
    fn test_analyze_streaming() {
        let job = analyze(&["-c", "-", "-o", "out.o"]);
        assert!(job.streaming);
        assert_eq!(job.input_file, "-");
    }

    #[test]
    fn test_analyze_no_input() {
        assert!(
            CompileJob::analyze(OsStr::new("gcc"), &os(&["-c"]), Path::new("/"), "x86_64")
                .is_err()
        );
    }

    #[test]
    fn test_dwo_file() {
        let mut job = analyze(&["-c", "foo.c", "-o", "dir/foo.o"]);
        assert_eq!(job.dwo_file(), "dir/foo.dwo");
        job.output_file = "noext".into();
        assert_eq!(job.dwo_file(), "noext.dwo");
    }

    #[test]
    fn test_compiler_is_clang() {
        let mut job = analyze(&["-c", "foo.c"]);
        assert!(!compiler_is_clang(&job));
        job.compiler_name = "clang++".into();
        assert!(compiler_is_clang(&job));
    }

    #[test]
    fn test_build_local_exit_code() {
        let mut creator = MockCommandCreator::new();
        creator.next_command_spawns(Ok(MockChild::new(exit_status(1), "", "nope")));
        let job = analyze(&["-c", "foo.c"]);
        assert_eq!(build_local(&mut creator, &job).unwrap(), 1);
    }

    #[test]
    fn test_call_cpp_spawn_failure() {
        let mut creator = MockCommandCreator::new();
        creator.next_command_spawns(Err(io::Error::new(io::ErrorKind::NotFound, "no cpp")));
        let job = analyze(&["-c", "foo.c"]);
        assert!(call_cpp(&mut creator, &job, Stdio::null()).is_err());
    }
}

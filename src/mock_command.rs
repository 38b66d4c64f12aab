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

//! Traits to allow mocking process execution.
//!
//! The preprocessor and the local compiler are spawned through these so unit
//! tests can run without a toolchain installed.

use std::ffi::OsStr;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};

/// A started process.
pub trait CommandChild {
    type O: Read + Send;

    fn take_stdout(&mut self) -> Option<Self::O>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
    fn wait_with_output(self) -> io::Result<Output>;
    /// Terminate the process. Used when streaming its output fails
    /// mid-flight.
    fn kill(&mut self) -> io::Result<()>;
}

impl CommandChild for Child {
    type O = ChildStdout;

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }
    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.wait()
    }
    fn wait_with_output(self) -> io::Result<Output> {
        self.wait_with_output()
    }
    fn kill(&mut self) -> io::Result<()> {
        self.kill()
    }
}

/// A process builder.
pub trait RunCommand {
    type C: CommandChild;

    fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self;
    fn args<S: AsRef<OsStr>>(&mut self, args: &[S]) -> &mut Self;
    fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self;
    fn stdin(&mut self, cfg: Stdio) -> &mut Self;
    fn stdout(&mut self, cfg: Stdio) -> &mut Self;
    fn stderr(&mut self, cfg: Stdio) -> &mut Self;
    fn spawn(&mut self) -> io::Result<Self::C>;
}

impl RunCommand for Command {
    type C = Child;

    fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Command {
        self.arg(arg)
    }
    fn args<S: AsRef<OsStr>>(&mut self, args: &[S]) -> &mut Command {
        self.args(args)
    }
    fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Command {
        self.current_dir(dir)
    }
    fn stdin(&mut self, cfg: Stdio) -> &mut Command {
        self.stdin(cfg)
    }
    fn stdout(&mut self, cfg: Stdio) -> &mut Command {
        self.stdout(cfg)
    }
    fn stderr(&mut self, cfg: Stdio) -> &mut Command {
        self.stderr(cfg)
    }
    fn spawn(&mut self) -> io::Result<Child> {
        self.spawn()
    }
}

pub trait CommandCreator {
    type Cmd: RunCommand;

    fn new_command<S: AsRef<OsStr>>(&mut self, program: S) -> Self::Cmd;
}

/// The production implementation, running real processes.
pub struct ProcessCommandCreator;

impl CommandCreator for ProcessCommandCreator {
    type Cmd = Command;

    fn new_command<S: AsRef<OsStr>>(&mut self, program: S) -> Command {
        Command::new(program)
    }
}

#[cfg(unix)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    // The raw wait status puts the exit code in the second byte.
    ExitStatus::from_raw(code << 8)
}

#[cfg(windows)]
pub fn exit_status(code: u32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code)
}

pub struct MockChild {
    pub output: Option<io::Result<Output>>,
    stdout: Option<Cursor<Vec<u8>>>,
}

impl MockChild {
    pub fn new(status: ExitStatus, stdout: &str, stderr: &str) -> MockChild {
        MockChild {
            stdout: Some(Cursor::new(stdout.as_bytes().to_vec())),
            output: Some(Ok(Output {
                status,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            })),
        }
    }

    pub fn with_error(err: io::Error) -> MockChild {
        MockChild {
            stdout: None,
            output: Some(Err(err)),
        }
    }
}

impl CommandChild for MockChild {
    type O = Cursor<Vec<u8>>;

    fn take_stdout(&mut self) -> Option<Cursor<Vec<u8>>> {
        self.stdout.take()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        match self.output.take().expect("wait called on finished MockChild") {
            Ok(output) => {
                let status = output.status;
                self.output = Some(Ok(output));
                Ok(status)
            }
            Err(e) => Err(e),
        }
    }

    fn wait_with_output(mut self) -> io::Result<Output> {
        self.output.take().expect("wait called on finished MockChild")
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct MockCommand {
    pub child: Option<io::Result<MockChild>>,
}

impl RunCommand for MockCommand {
    type C = MockChild;

    fn arg<S: AsRef<OsStr>>(&mut self, _arg: S) -> &mut MockCommand {
        self
    }
    fn args<S: AsRef<OsStr>>(&mut self, _args: &[S]) -> &mut MockCommand {
        self
    }
    fn current_dir<P: AsRef<Path>>(&mut self, _dir: P) -> &mut MockCommand {
        self
    }
    fn stdin(&mut self, _cfg: Stdio) -> &mut MockCommand {
        self
    }
    fn stdout(&mut self, _cfg: Stdio) -> &mut MockCommand {
        self
    }
    fn stderr(&mut self, _cfg: Stdio) -> &mut MockCommand {
        self
    }
    fn spawn(&mut self) -> io::Result<MockChild> {
        self.child.take().unwrap()
    }
}

/// Hands out a scripted sequence of children, in order.
#[derive(Default)]
pub struct MockCommandCreator {
    /// Children to return, in the order commands are spawned.
    pub children: Vec<io::Result<MockChild>>,
}

impl MockCommandCreator {
    pub fn new() -> MockCommandCreator {
        MockCommandCreator::default()
    }

    /// The next spawned command will return `child`.
    pub fn next_command_spawns(&mut self, child: io::Result<MockChild>) {
        self.children.push(child);
    }
}

impl CommandCreator for MockCommandCreator {
    type Cmd = MockCommand;

    fn new_command<S: AsRef<OsStr>>(&mut self, _program: S) -> MockCommand {
        assert!(!self.children.is_empty(), "unexpected process spawned");
        MockCommand {
            child: Some(self.children.remove(0)),
        }
    }
}

/// To simplify handing a single creator to code that spawns several
/// processes from different call sites in tests.
impl<T: CommandCreator> CommandCreator for Arc<Mutex<T>> {
    type Cmd = T::Cmd;

    fn new_command<S: AsRef<OsStr>>(&mut self, program: S) -> T::Cmd {
        self.lock().unwrap().new_command(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_child_wait_twice() {
        let mut child = MockChild::new(exit_status(1), "", "");
        assert_eq!(child.wait().unwrap().code(), Some(1));
        assert_eq!(child.wait().unwrap().code(), Some(1));
    }

    #[test]
    fn test_mock_creator_in_order() {
        let mut creator = MockCommandCreator::new();
        creator.next_command_spawns(Ok(MockChild::new(exit_status(0), "first", "")));
        creator.next_command_spawns(Ok(MockChild::new(exit_status(2), "second", "")));
        let out = creator
            .new_command("a")
            .spawn()
            .unwrap()
            .wait_with_output()
            .unwrap();
        assert_eq!(out.stdout, b"first");
        let out = creator
            .new_command("b")
            .spawn()
            .unwrap()
            .wait_with_output()
            .unwrap();
        assert_eq!(out.status.code(), Some(2));
    }
}

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
use clap::{App, AppSettings, Arg};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use which::which_in;

/// A specific command to run.
pub enum Command {
    /// Run a compiler command, remotely if possible.
    Compile {
        /// The compiler to execute.
        exe: OsString,
        /// The commandline arguments to pass to `exe`.
        cmdline: Vec<OsString>,
        /// The directory in which to execute the command.
        cwd: PathBuf,
    },
}

/// Get the `App` used for argument parsing.
pub fn get_app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .setting(AppSettings::TrailingVarArg)
        .arg(Arg::with_name("cmd").multiple(true).use_delimiter(false))
}

/// Parse the commandline into a `Command` to execute.
pub fn parse() -> Result<Command> {
    trace!("parse");
    let cwd =
        env::current_dir().context("icelink: Couldn't determine current working directory")?;
    let mut args: Vec<_> = env::args_os().collect();
    if let Ok(exe) = env::current_exe() {
        match exe
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
        {
            // If the executable has its standard name, do nothing.
            Some(ref e) if e == env!("CARGO_PKG_NAME") => {}
            // Otherwise it was copied/hardlinked under a compiler's name;
            // act as if it were invoked with `icelink $name`, resolving
            // $name through the PATH.
            _ => {
                if let (Some(path), Some(exe_filename)) = (env::var_os("PATH"), exe.file_name())
                {
                    if let Ok(full_path) = which_in(exe_filename, Some(&path), &cwd) {
                        args[0] = full_path.into();
                    }
                    args.insert(0, env!("CARGO_PKG_NAME").into());
                }
            }
        }
    }
    let matches = get_app().get_matches_from(args);

    if let Some(mut cmd) = matches.values_of_os("cmd") {
        if let Some(exe) = cmd.next() {
            return Ok(Command::Compile {
                exe: exe.to_owned(),
                cmdline: cmd.map(|s| s.to_owned()).collect(),
                cwd,
            });
        }
    }
    bail!("No compile command specified");
}

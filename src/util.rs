// Copyright 2017 Mozilla Foundation
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

use std::env;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

/// Absolutize and lexically normalize `file` for use as a job-identity key.
///
/// `//`, `/./` and `/..` are collapsed textually, repeatedly, without
/// consulting the filesystem; symlinks are deliberately not resolved. The
/// scheduler only needs a stable spelling, not a canonical inode.
pub fn get_absfilename(file: &str) -> String {
    if file.is_empty() {
        return String::new();
    }

    let mut file = if !file.starts_with('/') {
        let cwd = env::current_dir().unwrap_or_default();
        format!("{}/{}", cwd.display(), file)
    } else {
        file.to_owned()
    };

    for (pattern, replacement) in [("/..", "/"), ("/./", "/"), ("//", "/")] {
        while let Some(idx) = file.find(pattern) {
            file.replace_range(idx..idx + pattern.len(), replacement);
        }
    }

    file
}

/// Calculate the md5 digest of the contents of `path`, rendered as 32
/// lowercase hex characters. Returns the empty string if the file cannot be
/// opened; callers treat that as "digest unavailable".
pub fn file_digest<T: AsRef<Path>>(path: T) -> String {
    let Ok(f) = File::open(path.as_ref()) else {
        return String::new();
    };
    let mut ctx = md5::Context::new();
    let mut reader = BufReader::new(f);
    let mut buffer = [0; 40000];
    loop {
        let count = match reader.read(&mut buffer[..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return String::new(),
        };
        ctx.consume(&buffer[..count]);
    }
    format!("{:x}", ctx.compute())
}

/// Format `duration` as seconds with a fractional component.
pub fn fmt_duration_as_secs(duration: &Duration) -> String {
    format!("{}.{:03}s", duration.as_secs(), duration.subsec_millis())
}

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

//! The catalog of compiler environments the submitter can ship.

use crate::errors::*;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// Ordered `(platform, value)` pairs. After parsing, the value is the
/// tarball path; after [`rip_out_paths`], the version id.
pub type Environments = Vec<(String, String)>;

/// A tarball below this size cannot possibly hold a toolchain.
const MIN_ENV_SIZE: u64 = 500;

const ARCHIVE_SUFFIXES: &[&str] = &[".tar.bz2", ".tar.gz", ".tar", ".tgz"];

/// Parse an environment descriptor of comma-separated
/// `[platform:]path[=prefix]` entries.
///
/// Unusable entries (duplicate platform, unreadable, too small, prefix
/// mismatch) are logged and skipped; only an empty result is fatal.
pub fn parse_environments(
    descriptor: &str,
    target_platform: &str,
    prefix: &str,
) -> Result<Environments> {
    let mut envs = Environments::new();
    // Any `=` anywhere puts the whole descriptor in prefix-qualified mode.
    let prefix_qualified = descriptor.contains('=');

    for entry in descriptor.split(',').filter(|e| !e.is_empty()) {
        let (platform, mut value) = match entry.find(':') {
            Some(colon) => (&entry[..colon], &entry[colon + 1..]),
            None => (target_platform, entry),
        };

        if prefix_qualified {
            match value.find('=') {
                Some(eq) => {
                    if &value[eq + 1..] != prefix {
                        continue;
                    }
                    value = &value[..eq];
                }
                None => {
                    if !prefix.is_empty() {
                        continue;
                    }
                }
            }
        }

        if envs.iter().any(|(p, _)| p == platform) {
            warn!(
                "there are two environments for platform {} - ignoring {}",
                platform, value
            );
            continue;
        }

        if File::open(value).is_err() {
            error!(
                "$ICECC_VERSION has to point to an existing file to be installed {}",
                value
            );
            continue;
        }

        // lstat: a symlinked or otherwise irregular entry is not shippable.
        match std::fs::symlink_metadata(value) {
            Ok(md) if md.is_file() && md.len() >= MIN_ENV_SIZE => {}
            _ => {
                error!(
                    "$ICECC_VERSION has to point to an existing file to be installed {}",
                    value
                );
                continue;
            }
        }

        envs.push((platform.to_owned(), value.to_owned()));
    }

    if envs.is_empty() {
        return Err(client_error(
            ErrorKind::Config,
            22,
            "$ICECC_VERSION contains no usable environments",
        ));
    }
    Ok(envs)
}

/// The environment catalog resolved to version ids and tarball paths.
#[derive(Debug, Default)]
pub struct ResolvedEnvironments {
    /// `(platform, version id)`, in descriptor order.
    pub versions: Environments,
    /// platform -> version id
    pub version_map: HashMap<String, String>,
    /// platform -> absolute tarball path
    pub versionfile_map: HashMap<String, String>,
}

/// Strip the archive suffixes off the parsed catalog. Entries that are not
/// recognizable archives are dropped.
pub fn rip_out_paths(envs: &Environments) -> ResolvedEnvironments {
    let mut resolved = ResolvedEnvironments::default();

    for (platform, path) in envs {
        let Some(stripped) = ARCHIVE_SUFFIXES
            .iter()
            .find_map(|suff| path.strip_suffix(suff))
        else {
            continue;
        };
        let version = Path::new(stripped)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        resolved
            .versionfile_map
            .insert(platform.clone(), path.clone());
        resolved
            .version_map
            .insert(platform.clone(), version.clone());
        resolved.versions.push((platform.clone(), version));
    }

    resolved
}

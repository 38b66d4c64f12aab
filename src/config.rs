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

use crate::compiler::ColorMode;
use std::env;

/// The port the local daemon listens on.
pub const DEFAULT_DAEMON_PORT: u16 = 10245;

/// Driver configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// The environment descriptor (`ICECC_VERSION`).
    pub icecc_version: Option<String>,
    /// Host the scheduler should prefer for this submitter.
    pub preferred_host: Option<String>,
    /// Disable the loopback shortcut so test harnesses can exercise the
    /// remote path against a local peer.
    pub test_remotebuild: bool,
    /// Refuse compile servers too old to verify the shipped environment.
    pub ignore_unverified: bool,
    /// Probability per mille of promoting a compile to triple redundancy.
    pub repeat_rate: u32,
    pub daemon_port: u16,
    pub color_diagnostics: ColorMode,
}

impl Config {
    pub fn from_env() -> Config {
        let bool_var = |name: &str| env::var_os(name).is_some_and(|v| v != "0");
        Config {
            icecc_version: env::var("ICECC_VERSION").ok().filter(|v| !v.is_empty()),
            preferred_host: env::var("ICECC_PREFERRED_HOST").ok().filter(|v| !v.is_empty()),
            test_remotebuild: env::var_os("ICECC_TEST_REMOTEBUILD").is_some(),
            ignore_unverified: bool_var("ICECC_IGNORE_UNVERIFIED"),
            repeat_rate: env::var("ICECC_REPEAT_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            daemon_port: env::var("ICECC_DAEMON_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DAEMON_PORT),
            color_diagnostics: match env::var("ICECC_COLOR_DIAGNOSTICS").as_deref() {
                Ok("never") | Ok("0") => ColorMode::Off,
                Ok("always") | Ok("1") => ColorMode::On,
                _ => ColorMode::Auto,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            icecc_version: None,
            preferred_host: None,
            test_remotebuild: false,
            ignore_unverified: false,
            repeat_rate: 0,
            daemon_port: DEFAULT_DAEMON_PORT,
            color_diagnostics: ColorMode::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.daemon_port, DEFAULT_DAEMON_PORT);
        assert_eq!(cfg.repeat_rate, 0);
        assert!(!cfg.ignore_unverified);
    }
}

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

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_no_compile_command() {
    Command::cargo_bin("icelink")
        .unwrap()
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("No compile command"));
}

#[test]
fn test_missing_icecc_version() {
    Command::cargo_bin("icelink")
        .unwrap()
        .env_remove("ICECC_VERSION")
        .args(["gcc", "-c", "foo.c", "-o", "foo.o"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("ICECC_VERSION"));
}

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

//! Shared fixtures: fake tarballs and in-process protocol peers.

use crate::client::MsgChannel;
use crate::protocol::Msg;
use std::fs::File;
use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Create a file big enough to pass the catalog's size check. Returns its
/// path as a string, the way descriptors carry it.
pub fn write_fake_tarball(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    let mut f = File::create(&path).unwrap();
    f.write_all(&[b'x'; 600]).unwrap();
    path.to_string_lossy().into_owned()
}

/// Spawn a scripted peer (broker or compile server) on a loopback port.
///
/// The script runs on the accepted connection after the protocol-version
/// exchange; whatever it returns comes back through the join handle.
pub fn mock_peer<R, F>(own_protocol: u32, script: F) -> (u16, thread::JoinHandle<R>)
where
    F: FnOnce(&mut MsgChannel) -> R + Send + 'static,
    R: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut chan = MsgChannel::over(stream, "mock".into(), own_protocol).unwrap();
        script(&mut chan)
    });
    (port, handle)
}

/// A peer that just records everything it receives until the other side
/// hangs up (or five seconds pass). Stands in for the local daemon.
pub fn recording_peer(own_protocol: u32) -> (u16, thread::JoinHandle<Vec<Msg>>) {
    mock_peer(own_protocol, |chan| {
        let mut msgs = vec![];
        while let Ok(msg) = chan.get_msg(Duration::from_secs(5)) {
            msgs.push(msg);
        }
        msgs
    })
}

/// Connect a channel to a mock peer's port.
pub fn connect_to(port: u16) -> MsgChannel {
    MsgChannel::connect("127.0.0.1", port, Duration::from_secs(10)).unwrap()
}

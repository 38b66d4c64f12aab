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
use crate::protocol::{Msg, PROTOCOL_VERSION};
use byteorder::{BigEndian, ByteOrder};
use retry::{delay::Fixed, retry};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// How long the protocol-version exchange may take after the TCP connect.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A framed message channel to the local daemon or to a compile server.
///
/// Messages are a 4-byte big-endian length followed by a bincode-encoded
/// [`Msg`]. On creation both sides exchange their protocol version; the
/// effective protocol is the minimum of the two.
pub struct MsgChannel {
    /// Mode and deadline control for the socket under the buffered pair.
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    /// Peer name, for diagnostics ("compiled on <name>").
    pub name: String,
    protocol: u32,
    wire_sent: u64,
    wire_received: u64,
}

impl MsgChannel {
    /// Wrap an established stream, performing the version exchange.
    pub fn over(stream: TcpStream, name: String, own_protocol: u32) -> Result<MsgChannel> {
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let mut chan = MsgChannel {
            stream,
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            name,
            protocol: own_protocol,
            wire_sent: 0,
            wire_received: 0,
        };
        let mut bytes = [0; 4];
        BigEndian::write_u32(&mut bytes, own_protocol);
        chan.writer.write_all(&bytes)?;
        chan.writer.flush()?;
        chan.reader
            .read_exact(&mut bytes)
            .context("Failed to read protocol version")?;
        let peer = BigEndian::read_u32(&bytes);
        chan.protocol = std::cmp::min(own_protocol, peer);
        trace!(
            "channel to {}: peer protocol {}, using {}",
            chan.name,
            peer,
            chan.protocol
        );
        Ok(chan)
    }

    /// Establish a channel to `host:port` within `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<MsgChannel> {
        trace!("connect({}:{})", host, port);
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return MsgChannel::over(stream, host.to_owned(), PROTOCOL_VERSION),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Error::new)
            .unwrap_or_else(|| anyhow!("could not resolve {}", host)))
    }

    /// The negotiated protocol version of this channel.
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Frame bytes written to the wire so far.
    pub fn wire_sent(&self) -> u64 {
        self.wire_sent
    }

    /// Frame bytes read off the wire so far.
    pub fn wire_received(&self) -> u64 {
        self.wire_received
    }

    /// Send one message.
    pub fn send_msg(&mut self, msg: &Msg) -> Result<()> {
        let data = bincode::serialize(msg)?;
        let mut bytes = [0; 4];
        BigEndian::write_u32(&mut bytes, data.len() as u32);
        self.writer.write_all(&bytes)?;
        self.writer.write_all(&data)?;
        self.writer.flush()?;
        self.wire_sent += 4 + data.len() as u64;
        Ok(())
    }

    /// Read one message, waiting at most `timeout`.
    pub fn get_msg(&mut self, timeout: Duration) -> Result<Msg> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.read_one_msg()
    }

    /// Read one message if one is already pending, without blocking.
    ///
    /// Used to drain fault reports from a failing server before the channel
    /// is released. A partially received frame is abandoned.
    pub fn try_get_msg(&mut self) -> Option<Msg> {
        if self.stream.set_nonblocking(true).is_err() {
            return None;
        }
        let res = self.read_one_msg();
        let _ = self.stream.set_nonblocking(false);
        res.ok()
    }

    fn read_one_msg(&mut self) -> Result<Msg> {
        let mut bytes = [0; 4];
        self.reader
            .read_exact(&mut bytes)
            .context("Failed to read message header")?;
        let len = BigEndian::read_u32(&bytes);
        let mut data = vec![0; len as usize];
        self.reader.read_exact(&mut data)?;
        self.wire_received += 4 + len as u64;
        Ok(bincode::deserialize(&data)?)
    }
}

/// Establish a channel to the local daemon listening on `port`.
pub fn connect_to_daemon(port: u16) -> Result<MsgChannel> {
    trace!("connect_to_daemon({})", port);
    MsgChannel::connect("127.0.0.1", port, Duration::from_secs(5))
}

/// Attempt to establish a channel to the local daemon.
///
/// If the connection fails, retry a few times; the daemon may still be
/// starting up.
pub fn connect_with_retry(port: u16) -> Result<MsgChannel> {
    trace!("connect_with_retry({})", port);
    match retry(Fixed::from_millis(500).take(10), || connect_to_daemon(port)) {
        Ok(conn) => Ok(conn),
        Err(_) => Err(Error::new(io::Error::new(
            io::ErrorKind::TimedOut,
            "Connection to local daemon timed out",
        ))),
    }
}

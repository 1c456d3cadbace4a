// Copyright 2022 The Ledgerd Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Out-of-band descriptor passing.
//!
//! Two channels in the fleet move descriptors after spawn time: the listener
//! forwards accepted client sockets to the protocol service, and the
//! supervisor hands the notification client sockets to the canonization and
//! protocol services over their control sockets. Both use `SCM_RIGHTS` with
//! a one-byte carrier payload.

use anyhow::{bail, Context};
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

const CARRIER: [u8; 1] = [0x5a];

/// Sends `fd` over the stream socket `sock`. Blocking; used by the listener
/// (a send is instantaneous on a socket pair) and by the supervisor.
pub fn send_fd(sock: RawFd, fd: RawFd) -> anyhow::Result<()> {
    let iov = [IoVec::from_slice(&CARRIER)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg(sock, &iov, &cmsg, MsgFlags::empty(), None).context("passing a descriptor")?;
    Ok(())
}

/// Receives one descriptor from a non-blocking socket; `Ok(None)` when no
/// message is ready yet.
pub fn try_recv_fd(sock: RawFd) -> anyhow::Result<Option<RawFd>> {
    let mut carrier = [0_u8; 1];
    let iov = [IoVec::from_mut_slice(&mut carrier)];
    let mut cmsg = cmsg_space!([RawFd; 1]);

    match recvmsg(sock, &iov, Some(&mut cmsg), MsgFlags::empty()) {
        Ok(message) => {
            if message.bytes == 0 {
                bail!("descriptor channel closed");
            }
            for control in message.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = control {
                    if let Some(fd) = fds.first() {
                        return Ok(Some(*fd));
                    }
                }
            }
            bail!("descriptor message carried no descriptor")
        }
        Err(Errno::EAGAIN) => Ok(None),
        Err(err) => Err(err).context("receiving a descriptor"),
    }
}

/// Awaits one descriptor on an async socket.
pub async fn recv_fd(stream: &tokio::net::UnixStream) -> anyhow::Result<RawFd> {
    loop {
        stream.readable().await?;
        if let Some(fd) = try_recv_fd(stream.as_raw_fd())? {
            return Ok(fd);
        }
    }
}

/// Awaits a descriptor and wraps it as an async unix stream.
pub async fn recv_fd_stream(
    stream: &tokio::net::UnixStream,
) -> anyhow::Result<tokio::net::UnixStream> {
    let fd = recv_fd(stream).await?;
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .context("preparing a passed descriptor")?;
    tokio::net::UnixStream::from_std(std_stream).context("registering a passed descriptor")
}

/// Awaits a descriptor and wraps it as an async TCP stream. Used by the
/// protocol service for accepted client sockets.
pub async fn recv_fd_tcp(
    stream: &tokio::net::UnixStream,
) -> anyhow::Result<tokio::net::TcpStream> {
    let fd = recv_fd(stream).await?;
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .context("preparing an accepted socket")?;
    tokio::net::TcpStream::from_std(std_stream).context("registering an accepted socket")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};

    #[test]
    fn descriptor_crosses_a_socketpair() {
        let (sender, receiver) = std::os::unix::net::UnixStream::pair().unwrap();
        let (mut payload_writer, payload_reader) = std::os::unix::net::UnixStream::pair().unwrap();

        send_fd(sender.as_raw_fd(), payload_reader.as_raw_fd()).unwrap();

        receiver.set_nonblocking(true).unwrap();
        let passed = loop {
            if let Some(fd) = try_recv_fd(receiver.as_raw_fd()).unwrap() {
                break fd;
            }
        };
        // The passed descriptor reads what the original wrote.
        payload_writer.write_all(b"hi").unwrap();
        let mut passed = unsafe { std::os::unix::net::UnixStream::from_raw_fd(passed) };
        let mut buf = [0_u8; 2];
        passed.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}

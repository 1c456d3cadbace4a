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

//! The random service.
//!
//! Owns the random device descriptor and proxies fixed-size random blocks to
//! its clients — the protocol service (nonces) and the canonization service
//! (fresh block ids). A request is a `u64` frame carrying the byte count;
//! the answer is a `data` frame of exactly that many bytes.

use anyhow::{bail, Context};
use futures::{SinkExt, StreamExt};
use log::info;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use std::os::unix::io::{FromRawFd, RawFd};

use ledgerd_ipc::{Frame, FrameCodec, FrameError};

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, Fibers};

// An upper bound keeps a confused client from draining the entropy pool.
const MAX_RANDOM_REQUEST: u64 = 4096;

/// Client side of the random service.
#[derive(Debug)]
pub struct RandomClient {
    io: tokio_util::codec::Framed<tokio::net::UnixStream, FrameCodec>,
}

impl RandomClient {
    /// Wraps a connected random-service socket.
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            io: tokio_util::codec::Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Requests `count` random bytes.
    pub async fn random_bytes(&mut self, count: u64) -> anyhow::Result<Vec<u8>> {
        self.io.send(Frame::U64(count)).await?;
        let frame = self
            .io
            .next()
            .await
            .ok_or(FrameError::PeerClosed)??;
        let bytes = frame.into_data()?;
        if bytes.len() as u64 != count {
            bail!("random service answered {} bytes for {}", bytes.len(), count);
        }
        Ok(bytes)
    }

    /// Draws a fresh id.
    pub async fn random_uuid(&mut self) -> anyhow::Result<Uuid> {
        let bytes = self.random_bytes(16).await?;
        Ok(Uuid::from_slice(&bytes).context("branding random bytes as an id")?)
    }
}

/// The serving fiber for one client socket.
pub async fn client_fiber(
    stream: tokio::net::UnixStream,
    device_fd: RawFd,
    fibers: Fibers,
) -> anyhow::Result<()> {
    // The device descriptor is duplicated per client so each fiber owns an
    // independent read position.
    let device_copy = nix::unistd::dup(device_fd).context("duplicating the random device")?;
    let device = unsafe { std::fs::File::from_raw_fd(device_copy) };
    // Reads go through the blocking pool so a slow entropy pool cannot
    // starve the other fibers.
    let mut device = tokio::fs::File::from_std(device);

    let mut io = tokio_util::codec::Framed::new(stream, FrameCodec::default());
    let mut state = fibers.state();
    loop {
        let frame = tokio::select! {
            frame = io.next() => frame,
            shutdown = runtime::shutdown_requested(&mut state) => {
                info!("random service draining ({:?})", shutdown);
                return Ok(());
            }
        };
        let frame = match frame {
            Some(frame) => frame?,
            None => return Ok(()),
        };

        let count = frame.as_u64()?;
        if count == 0 || count > MAX_RANDOM_REQUEST {
            return Err(FrameError::BadSize {
                tag: 0x38,
                len: count as usize,
            }
            .into());
        }

        let mut bytes = vec![0_u8; count as usize];
        device
            .read_exact(&mut bytes)
            .await
            .context("reading the random device")?;
        io.send(Frame::Data(bytes)).await?;
    }
}

/// Entry point for the random service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let device_fd = ServiceKind::Random
        .fd_for(FdRole::RandomDevice)
        .expect("random layout has a device");
    let protocol_fd = ServiceKind::Random
        .fd_for(FdRole::ProtocolClient)
        .expect("random layout has a protocol client");
    let canonization_fd = ServiceKind::Random
        .fd_for(FdRole::CanonizationClient)
        .expect("random layout has a canonization client");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        fibers.spawn(
            "random-protocol",
            client_fiber(
                super::stream_from_fd(protocol_fd)?,
                device_fd,
                fibers.clone(),
            ),
        );
        fibers.spawn(
            "random-canonization",
            client_fiber(
                super::stream_from_fd(canonization_fd)?,
                device_fd,
                fibers.clone(),
            ),
        );
        Ok(())
    })
}

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

//! The listener service.
//!
//! One accept fiber per bound listen socket. The service never reads client
//! bytes: every accepted descriptor is forwarded to the protocol service
//! over the accept-forward socket and closed locally. The bound sockets
//! themselves were created and bound by the supervisor while privileged;
//! they arrive packed at the well-known descriptor numbers.

use anyhow::Context;
use log::{debug, info};
use nix::fcntl::{fcntl, FcntlArg};

use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, Fibers};
use crate::supervisor::fdpass;

// Listen sockets occupy the descriptors after the fixed layout, packed
// contiguously.
const MAX_LISTEN_SOCKETS: RawFd = 62;

/// The descriptors of the inherited listen sockets.
pub fn inherited_listen_fds() -> Vec<RawFd> {
    let first = ServiceKind::Listener.fd_layout().len() as RawFd;
    (first..first + MAX_LISTEN_SOCKETS)
        .take_while(|fd| fcntl(*fd, FcntlArg::F_GETFD).is_ok())
        .collect()
}

/// The accept fiber for one bound socket.
pub async fn listen_fiber(
    listen_fd: RawFd,
    forward_fd: RawFd,
    fibers: Fibers,
) -> anyhow::Result<()> {
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(listen_fd) };
    std_listener
        .set_nonblocking(true)
        .context("preparing a listen socket")?;
    let listener =
        tokio::net::TcpListener::from_std(std_listener).context("registering a listen socket")?;

    let mut state = fibers.state();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            shutdown = runtime::shutdown_requested(&mut state) => {
                info!("listener draining ({:?})", shutdown);
                return Ok(());
            }
        };
        let (stream, peer) = accepted.context("accepting a connection")?;
        debug!("accepted connection from {}", peer);

        // Hand the descriptor across and drop our copy.
        let std_stream = stream.into_std().context("detaching an accepted socket")?;
        let raw = std_stream.into_raw_fd();
        let result = fdpass::send_fd(forward_fd, raw);
        let _ = nix::unistd::close(raw);
        result?;
    }
}

/// Entry point for the listener service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let forward_fd = ServiceKind::Listener
        .fd_for(FdRole::AcceptForward)
        .expect("listener layout has an accept-forward socket");
    let listen_fds = inherited_listen_fds();
    anyhow::ensure!(!listen_fds.is_empty(), "no listen sockets were handed down");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        for listen_fd in listen_fds {
            fibers.spawn(
                "accept",
                listen_fiber(listen_fd, forward_fd, fibers.clone()),
            );
        }
        Ok(())
    })
}

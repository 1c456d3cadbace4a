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

//! The notification service.
//!
//! Serves two client connections: the canonization service (which drives
//! block updates) and the protocol service (which relays client
//! subscriptions). Each connection gets a reader fiber and a writer fiber;
//! all state lives on the main thread behind a `RefCell`, and serializing a
//! client's responses through its writer fiber is what provides the
//! per-client delivery order.

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use log::info;

use std::cell::RefCell;
use std::rc::Rc;

use ledgerd::api::notification::{NotifyRequest, NotifyResponse};
use ledgerd_ipc::{Frame, FrameCodec};

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, Fibers};

pub mod client;
pub mod state;

pub use self::state::{ConnId, NotificationState};

type SharedState = Rc<RefCell<NotificationState>>;

/// Spawns the reader and writer fibers for one client connection.
pub fn spawn_connection(
    fibers: &Fibers,
    state: SharedState,
    conn: ConnId,
    stream: tokio::net::UnixStream,
    name: (&'static str, &'static str),
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded();
    state.borrow_mut().register(conn, outbound_tx);

    let (read_half, write_half) = stream.into_split();
    fibers.spawn(name.0, reader_fiber(read_half, state, conn, fibers.clone()));
    fibers.spawn(name.1, writer_fiber(write_half, outbound_rx));
}

async fn reader_fiber(
    read_half: tokio::net::unix::OwnedReadHalf,
    state: SharedState,
    conn: ConnId,
    fibers: Fibers,
) -> anyhow::Result<()> {
    let mut io = tokio_util::codec::FramedRead::new(read_half, FrameCodec::default());
    let mut run_state = fibers.state();
    loop {
        let frame = tokio::select! {
            frame = io.next() => frame,
            shutdown = runtime::shutdown_requested(&mut run_state) => {
                info!("notification connection {} draining ({:?})", conn, shutdown);
                break;
            }
        };
        let frame = match frame {
            Some(frame) => frame?,
            None => break,
        };
        let request = NotifyRequest::decode(&frame.into_data()?)?;
        state.borrow_mut().handle(conn, request);
    }
    state.borrow_mut().unregister(conn);
    Ok(())
}

async fn writer_fiber(
    write_half: tokio::net::unix::OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<NotifyResponse>,
) -> anyhow::Result<()> {
    let mut io = tokio_util::codec::FramedWrite::new(write_half, FrameCodec::default());
    while let Some(response) = outbound.next().await {
        io.send(Frame::Data(response.encode())).await?;
    }
    Ok(())
}

/// Entry point for the notification service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let canonization_fd = ServiceKind::Notification
        .fd_for(FdRole::CanonizationClient)
        .expect("notification layout has a canonization client");
    let protocol_fd = ServiceKind::Notification
        .fd_for(FdRole::ProtocolClient)
        .expect("notification layout has a protocol client");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        let state: SharedState = Rc::new(RefCell::new(NotificationState::new()));
        spawn_connection(
            &fibers,
            state.clone(),
            0,
            super::stream_from_fd(canonization_fd)?,
            ("canonization-read", "canonization-write"),
        );
        spawn_connection(
            &fibers,
            state,
            1,
            super::stream_from_fd(protocol_fd)?,
            ("protocol-read", "protocol-write"),
        );
        Ok(())
    })
}

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

//! The signal thread and its reaper fiber.
//!
//! Every service masks all signals process-wide at startup, then spawns one
//! OS thread whose only job is to `sigwait`. On delivery the thread writes a
//! quiesce token onto a socket pair, sleeps the grace period, and writes a
//! terminate token; the reaper fiber reads the tokens and broadcasts the
//! corresponding stage through the fiber registry. The socket pair is what
//! lets the cooperative scheduler wait on a blocking kernel facility.

use anyhow::Context;
use futures::StreamExt;
use log::{info, warn};
use nix::sys::signal::SigSet;
use tokio_util::codec::Framed;

use std::thread;
use std::time::Duration;

use ledgerd_ipc::{sync, Frame, FrameCodec};

use crate::runtime::Fibers;

/// Token written after the first signal: stop accepting new work.
pub const TOKEN_QUIESCE: i64 = 0;
/// Token written after the grace period: release everything and exit.
pub const TOKEN_TERMINATE: i64 = 1;

/// Grace period between the quiesce and terminate tokens.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Masks every signal for the calling thread and, by inheritance, every
/// thread spawned after it. Must run before any helper thread exists.
pub fn block_all_signals() -> anyhow::Result<()> {
    SigSet::all()
        .thread_block()
        .context("masking process signals")
}

/// Spawns the signal thread, returning the scheduler side of its socket
/// pair.
pub fn spawn_signal_thread(grace: Duration) -> anyhow::Result<tokio::net::UnixStream> {
    let (thread_sock, loop_sock) = std::os::unix::net::UnixStream::pair()
        .context("creating the signal socket pair")?;

    thread::Builder::new()
        .name("signal".to_owned())
        .spawn(move || signal_thread_main(thread_sock, grace))
        .context("spawning the signal thread")?;

    loop_sock
        .set_nonblocking(true)
        .context("preparing the signal socket")?;
    tokio::net::UnixStream::from_std(loop_sock).context("registering the signal socket")
}

fn signal_thread_main(mut sock: std::os::unix::net::UnixStream, grace: Duration) {
    let set = SigSet::all();
    let signal = match set.wait() {
        Ok(signal) => signal,
        Err(err) => {
            warn!("sigwait failed: {}", err);
            return;
        }
    };
    info!("caught signal {}", signal);

    if sync::write_frame(&mut sock, &Frame::I64(TOKEN_QUIESCE)).is_err() {
        return;
    }
    thread::sleep(grace);
    sync::write_frame(&mut sock, &Frame::I64(TOKEN_TERMINATE)).ok();
}

/// The reaper fiber: translates signal-thread tokens into the two-stage
/// shutdown broadcast, then exits.
pub async fn reaper_fiber(
    sock: tokio::net::UnixStream,
    fibers: Fibers,
) -> anyhow::Result<()> {
    let mut io = Framed::new(sock, FrameCodec::default());
    while let Some(frame) = io.next().await {
        match frame?.as_i64()? {
            TOKEN_QUIESCE => fibers.quiesce(),
            TOKEN_TERMINATE => {
                fibers.terminate();
                return Ok(());
            }
            token => warn!("unknown signal token {}", token),
        }
    }
    // The signal thread went away without a terminate token.
    fibers.terminate();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{run_service, shutdown_requested, RunState};

    // Drives the reaper with a hand-rolled token stream instead of a real
    // signal thread, which would require delivering signals to the test
    // process.
    #[test]
    fn tokens_drive_two_stage_shutdown() {
        run_service(|fibers| async move {
            let (mut writer, reader) = tokio::net::UnixStream::pair()?;
            let mut state = fibers.state();
            fibers.spawn("reaper", reaper_fiber(reader, fibers.clone()));
            fibers.spawn("worker", async move {
                // Both tokens may land in one poll, so the first observed
                // state can be either stage.
                let seen = shutdown_requested(&mut state).await;
                assert!(matches!(seen, RunState::Quiescing | RunState::Terminating));
                while *state.borrow() != RunState::Terminating {
                    if state.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            });

            use tokio::io::AsyncWriteExt;
            let mut quiesce = Vec::new();
            sync::write_frame(&mut quiesce, &Frame::I64(TOKEN_QUIESCE))?;
            sync::write_frame(&mut quiesce, &Frame::I64(TOKEN_TERMINATE))?;
            writer.write_all(&quiesce).await?;
            Ok(())
        })
        .unwrap();
    }
}

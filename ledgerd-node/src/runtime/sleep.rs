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

//! The sleep thread.
//!
//! Tick-driven services (attestation, canonization) sleep between passes.
//! The sleep itself happens on a helper OS thread that reads a duration
//! frame, sleeps it off and answers with an ack frame, so that the fiber's
//! wait is an ordinary socket read the scheduler can multiplex with shutdown
//! tokens.

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use std::thread;
use std::time::Duration;

use ledgerd_ipc::{sync, Frame, FrameCodec, FrameError};

/// Scheduler-side handle to the sleep thread.
#[derive(Debug)]
pub struct SleepClient {
    io: Framed<tokio::net::UnixStream, FrameCodec>,
}

/// Spawns the sleep thread for this process.
pub fn spawn_sleep_thread() -> anyhow::Result<SleepClient> {
    let (thread_sock, loop_sock) =
        std::os::unix::net::UnixStream::pair().context("creating the sleep socket pair")?;

    thread::Builder::new()
        .name("sleep".to_owned())
        .spawn(move || sleep_thread_main(thread_sock))
        .context("spawning the sleep thread")?;

    loop_sock
        .set_nonblocking(true)
        .context("preparing the sleep socket")?;
    let stream =
        tokio::net::UnixStream::from_std(loop_sock).context("registering the sleep socket")?;
    Ok(SleepClient {
        io: Framed::new(stream, FrameCodec::default()),
    })
}

impl SleepClient {
    /// Sleeps for `duration`, suspending the calling fiber.
    pub async fn sleep(&mut self, duration: Duration) -> anyhow::Result<()> {
        let micros = duration.as_micros() as u64;
        self.io.send(Frame::U64(micros)).await?;
        match self.io.next().await {
            Some(frame) => {
                frame?.as_u8()?;
                Ok(())
            }
            None => Err(FrameError::PeerClosed.into()),
        }
    }
}

fn sleep_thread_main(mut sock: std::os::unix::net::UnixStream) {
    loop {
        let micros = match sync::read_u64(&mut sock) {
            Ok(micros) => micros,
            // The service went away; nothing left to do.
            Err(_) => return,
        };
        thread::sleep(Duration::from_micros(micros));
        if sync::write_frame(&mut sock, &Frame::U8(0)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::run_service;

    use std::time::Instant;

    #[test]
    fn sleep_waits_and_acks() {
        run_service(|fibers| async move {
            fibers.spawn("sleeper", async move {
                let mut client = spawn_sleep_thread()?;
                let start = Instant::now();
                client.sleep(Duration::from_millis(20)).await?;
                assert!(start.elapsed() >= Duration::from_millis(20));
                Ok(())
            });
            Ok(())
        })
        .unwrap();
    }
}

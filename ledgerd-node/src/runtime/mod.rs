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

//! The per-process fiber runtime.
//!
//! Each service runs a current-thread scheduler with a `LocalSet`; a fiber is
//! a local task that suspends only at I/O, mailbox operations or an explicit
//! yield. The management discipline is carried by [`Fibers`]: every fiber is
//! spawned through it, a management fiber [`reap`](FiberEvents::reap)s
//! stopped fibers, and the two-stage shutdown (`quiesce`, then `terminate`)
//! is broadcast through a watch channel every fiber can select on.

use anyhow::anyhow;
use futures::channel::mpsc;
use futures::StreamExt;
use log::{error, info, trace};
use tokio::sync::watch;

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

pub mod signal;
pub mod sleep;

/// Lifecycle state broadcast to every fiber in the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Normal operation.
    Running,
    /// Stop accepting new work; finish in-flight work.
    Quiescing,
    /// Abandon in-flight work and release resources.
    Terminating,
}

/// Events observed by the management fiber.
#[derive(Debug)]
enum FiberEvent {
    Started(&'static str),
    Stopped(&'static str, bool),
}

struct FibersInner {
    state_tx: watch::Sender<RunState>,
    state_rx: watch::Receiver<RunState>,
    events_tx: mpsc::UnboundedSender<FiberEvent>,
}

/// Handle for spawning fibers and driving the shutdown broadcast.
///
/// Clones share one management channel; the handle is cheap to pass to every
/// fiber that needs to spawn or to shut the process down.
#[derive(Clone)]
pub struct Fibers {
    inner: Rc<FibersInner>,
}

impl std::fmt::Debug for Fibers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fibers").finish()
    }
}

impl Fibers {
    /// Creates the fiber registry and its management-side event stream.
    pub fn new() -> (Self, FiberEvents) {
        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let (events_tx, events_rx) = mpsc::unbounded();
        let fibers = Self {
            inner: Rc::new(FibersInner {
                state_tx,
                state_rx,
                events_tx,
            }),
        };
        (
            fibers,
            FiberEvents {
                events_rx,
                active: Cell::new(0),
            },
        )
    }

    /// Spawns a named fiber on the local scheduler.
    ///
    /// The fiber's error, if any, is logged at the entry point; resource
    /// reclamation happens when the management fiber observes the stop event.
    pub fn spawn<F>(&self, name: &'static str, fiber: F)
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        let events = self.inner.events_tx.clone();
        events.unbounded_send(FiberEvent::Started(name)).ok();
        tokio::task::spawn_local(async move {
            let result = fiber.await;
            let ok = match result {
                Ok(()) => true,
                Err(ref err) => {
                    error!("fiber {} failed: {:#}", name, err);
                    false
                }
            };
            events.unbounded_send(FiberEvent::Stopped(name, ok)).ok();
        });
    }

    /// A receiver for the process run state.
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.inner.state_rx.clone()
    }

    /// The current run state.
    pub fn current_state(&self) -> RunState {
        *self.inner.state_rx.borrow()
    }

    /// Broadcasts the quiesce request: fibers mark themselves draining,
    /// complete in-flight work and accept no new work.
    pub fn quiesce(&self) {
        if self.current_state() == RunState::Running {
            info!("quiescing");
            self.inner.state_tx.send(RunState::Quiescing).ok();
        }
    }

    /// Broadcasts the termination request.
    pub fn terminate(&self) {
        if self.current_state() != RunState::Terminating {
            info!("terminating");
            self.inner.state_tx.send(RunState::Terminating).ok();
        }
    }
}

/// Waits until the state moves past `Running`, returning the new state.
///
/// The standard suspension arm for fibers that select between work and
/// shutdown.
pub async fn shutdown_requested(state: &mut watch::Receiver<RunState>) -> RunState {
    loop {
        let current = *state.borrow();
        if current != RunState::Running {
            return current;
        }
        if state.changed().await.is_err() {
            return RunState::Terminating;
        }
    }
}

/// The management fiber's view of the fleet of fibers in this process.
#[derive(Debug)]
pub struct FiberEvents {
    events_rx: mpsc::UnboundedReceiver<FiberEvent>,
    active: Cell<usize>,
}

impl FiberEvents {
    /// Runs the management fiber: observes start/stop events and returns
    /// when every fiber has stopped.
    pub async fn reap(mut self) {
        while let Some(event) = self.events_rx.next().await {
            match event {
                FiberEvent::Started(name) => {
                    trace!("fiber {} started", name);
                    self.active.set(self.active.get() + 1);
                }
                FiberEvent::Stopped(name, ok) => {
                    trace!("fiber {} stopped (ok = {})", name, ok);
                    self.active.set(self.active.get() - 1);
                    if self.active.get() == 0 {
                        return;
                    }
                }
            }
        }
    }
}

/// Typed FIFO mailboxes for intra-process messaging.
pub mod mailbox {
    use super::*;

    /// Sending side of a mailbox.
    #[derive(Debug)]
    pub struct Address<T> {
        tx: mpsc::Sender<T>,
    }

    impl<T> Clone for Address<T> {
        fn clone(&self) -> Self {
            Self {
                tx: self.tx.clone(),
            }
        }
    }

    /// Receiving side of a mailbox.
    #[derive(Debug)]
    pub struct Mailbox<T> {
        rx: mpsc::Receiver<T>,
    }

    /// Creates a bounded mailbox; sends suspend once `capacity` messages are
    /// in flight.
    pub fn channel<T>(capacity: usize) -> (Address<T>, Mailbox<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Address { tx }, Mailbox { rx })
    }

    impl<T> Address<T> {
        /// Delivers a message, suspending while the mailbox is full.
        pub async fn send(&mut self, message: T) -> anyhow::Result<()> {
            use futures::SinkExt;
            self.tx
                .send(message)
                .await
                .map_err(|_| anyhow!("mailbox closed"))
        }
    }

    impl<T> Mailbox<T> {
        /// Receives the next message; `None` once every address is dropped.
        pub async fn recv(&mut self) -> Option<T> {
            self.rx.next().await
        }
    }
}

/// Runs a service body on a fresh current-thread scheduler.
///
/// The body receives the fiber registry, spawns its fibers and returns; the
/// call then blocks until the management fiber has reaped every fiber.
pub fn run_service<F, Fut>(body: F) -> anyhow::Result<()>
where
    F: FnOnce(Fibers) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let (fibers, events) = Fibers::new();
        body(fibers).await?;
        events.reap().await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibers_run_and_are_reaped() {
        let counter = Rc::new(Cell::new(0));
        let observed = counter.clone();
        run_service(move |fibers| async move {
            for _ in 0..3 {
                let counter = observed.clone();
                fibers.spawn("worker", async move {
                    counter.set(counter.get() + 1);
                    Ok(())
                });
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn quiesce_then_terminate_reaches_fibers() {
        let states = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = states.clone();
        run_service(move |fibers| async move {
            let mut state = fibers.state();
            let control = fibers.clone();
            let (mut drained_tx, mut drained_rx) = mailbox::channel::<()>(1);
            fibers.spawn("observer", async move {
                let seen = shutdown_requested(&mut state).await;
                sink.borrow_mut().push(seen);
                // Report the drain so the driver can move to stage two.
                drained_tx.send(()).await?;
                while *state.borrow() != RunState::Terminating {
                    if state.changed().await.is_err() {
                        break;
                    }
                }
                sink.borrow_mut().push(*state.borrow());
                Ok(())
            });
            fibers.spawn("driver", async move {
                control.quiesce();
                drained_rx.recv().await;
                control.terminate();
                Ok(())
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(
            *states.borrow(),
            vec![RunState::Quiescing, RunState::Terminating]
        );
    }
}

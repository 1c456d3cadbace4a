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

//! The auth service.
//!
//! Holds the agent's key material for the client-facing authenticated
//! handshake, which is an external collaborator of this core. What the core
//! owns is the service's lifecycle: it is spawned, keyed and started like
//! every other service, and participates first in the ordered shutdown.

use log::info;

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal};
use crate::services::setup::run_control_setup;

/// Entry point for the auth service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let control_fd = ServiceKind::Auth
        .fd_for(FdRole::Control)
        .expect("auth layout has a control socket");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        let mut control = super::framed_from_fd(control_fd)?;
        let state = fibers.state();
        fibers.spawn("auth-loop", async move {
            let setup = run_control_setup(&mut control).await?;
            anyhow::ensure!(setup.identity.is_some(), "auth service was not keyed");
            info!("auth service keyed and running");

            // The handshake plane is external; hold the key material until
            // shutdown.
            let mut state = state;
            runtime::shutdown_requested(&mut state).await;
            Ok(())
        });
        Ok(())
    })
}

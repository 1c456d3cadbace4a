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

//! Service processes as the supervisor sees them.
//!
//! A service is spawned with its descriptor set remapped to the well-known
//! small integers of its layout and everything else closed; the supervisor
//! then drives it through `created → configured → keyed → running` over the
//! control socket, and through `stopped → reaped` at shutdown.

use anyhow::{bail, Context};
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use ledgerd::api::control::{ControlAck, ControlCommand};
use ledgerd::config::UserGroup;
use ledgerd::StatusCode;
use ledgerd_ipc::{sync, Frame};

use crate::handoff::{Handoff, ServiceKind};

// Scratch descriptor range used while remapping, safely above any real
// descriptor the supervisor creates.
const REMAP_BASE: RawFd = 800;

/// Supervisor-tracked lifecycle of one service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Process exists.
    Created,
    /// Configuration delivered and acknowledged.
    Configured,
    /// Key material delivered, where applicable.
    Keyed,
    /// `start` acknowledged.
    Running,
    /// Stop signal delivered.
    Stopped,
    /// Exit status collected.
    Reaped,
}

impl ServiceState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Created, Configured)
                | (Configured, Keyed)
                | (Configured, Running)
                | (Keyed, Running)
                | (Running, Stopped)
                | (Created, Stopped)
                | (Configured, Stopped)
                | (Keyed, Stopped)
                | (Stopped, Reaped)
        )
    }
}

/// One spawned service.
#[derive(Debug)]
pub struct Process {
    /// Display name.
    pub name: &'static str,
    /// Which service this is.
    pub kind: ServiceKind,
    /// Child pid.
    pub pid: Pid,
    /// Supervisor end of the control socket, for configurable services.
    pub control: Option<std::os::unix::net::UnixStream>,
    /// Tracked lifecycle state.
    pub state: ServiceState,
}

impl Process {
    /// Spawns a service with its descriptor handoff remapped to the
    /// well-known numbers. `keep_open` descriptors (the supervisor's ends of
    /// the handed-off pairs) stay open in the parent only.
    pub fn spawn(
        name: &'static str,
        kind: ServiceKind,
        exe: &Path,
        handoff: &Handoff,
        chroot: Option<&str>,
        usergroup: Option<&UserGroup>,
        control: Option<std::os::unix::net::UnixStream>,
    ) -> anyhow::Result<Self> {
        if !handoff.matches_layout(kind) {
            bail!("descriptor handoff does not match the {} layout", name);
        }

        let mut command = Command::new(exe);
        command.arg(kind.subcommand());
        if let Some(chroot) = chroot {
            command.args(&["--chroot", chroot]);
        }
        if let Some(usergroup) = usergroup {
            command.args(&["--user", &usergroup.user]);
            command.args(&["--group", &usergroup.group]);
        }
        command.stdin(Stdio::null());

        let fds: Vec<RawFd> = handoff.entries().iter().map(|(_, fd)| *fd).collect();
        // Safety: only async-signal-safe calls (dup2/close) run in the child
        // before exec.
        unsafe {
            command.pre_exec(move || {
                let os_err = |err: nix::errno::Errno| std::io::Error::from_raw_os_error(err as i32);
                // Two-phase remap so sources and targets cannot collide.
                for (index, fd) in fds.iter().enumerate() {
                    nix::unistd::dup2(*fd, REMAP_BASE + index as RawFd).map_err(os_err)?;
                }
                for index in 0..fds.len() as RawFd {
                    nix::unistd::dup2(REMAP_BASE + index, index).map_err(os_err)?;
                }
                // Close everything outside the handoff.
                for fd in fds.len() as RawFd..REMAP_BASE + fds.len() as RawFd + 1 {
                    let _ = nix::unistd::close(fd);
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning the {} service", name))?;
        info!("spawned {} as pid {}", name, child.id());

        Ok(Self {
            name,
            kind,
            pid: Pid::from_raw(child.id() as i32),
            control,
            state: ServiceState::Created,
        })
    }

    fn advance(&mut self, next: ServiceState) -> anyhow::Result<()> {
        if !self.state.can_advance_to(next) {
            bail!(
                "{}: illegal state transition {:?} -> {:?}",
                self.name,
                self.state,
                next
            );
        }
        debug!("{}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Sends one control command and checks the acknowledgement.
    pub fn send_command(&mut self, command: &ControlCommand) -> anyhow::Result<()> {
        let name = self.name;
        let control = self
            .control
            .as_mut()
            .with_context(|| format!("{} has no control socket", name))?;
        sync::write_frame(control, &Frame::Data(command.encode()))?;
        let ack_frame = sync::read_frame(control)?;
        let ack = ControlAck::decode(&ack_frame.into_data()?)?;
        if ack.command != command.id() || ack.status != StatusCode::Success {
            bail!("{} refused {:?}: {}", self.name, command.id(), ack.status);
        }
        Ok(())
    }

    /// Delivers configuration and advances to `configured`.
    pub fn configure(&mut self, command: &ControlCommand) -> anyhow::Result<()> {
        self.send_command(command)?;
        self.advance(ServiceState::Configured)
    }

    /// Delivers key material and advances to `keyed`.
    pub fn deliver_key(&mut self, command: &ControlCommand) -> anyhow::Result<()> {
        self.send_command(command)?;
        self.advance(ServiceState::Keyed)
    }

    /// Sends `start` and advances to `running`.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.send_command(&ControlCommand::Start)?;
        self.advance(ServiceState::Running)
    }

    /// Marks services without a configure phase as running once spawned.
    pub fn mark_running(&mut self) -> anyhow::Result<()> {
        self.advance(ServiceState::Configured)?;
        self.advance(ServiceState::Running)
    }

    /// Requests the two-stage stop by signalling the process.
    pub fn stop(&mut self) {
        if self.state == ServiceState::Reaped {
            return;
        }
        if let Err(err) = kill(self.pid, Signal::SIGTERM) {
            warn!("signalling {}: {}", self.name, err);
        }
        if self.state != ServiceState::Stopped {
            // Forced stops are legal from any live state.
            self.state = ServiceState::Stopped;
        }
    }

    /// Kills the process outright.
    pub fn kill_hard(&mut self) {
        if self.state == ServiceState::Reaped {
            return;
        }
        let _ = kill(self.pid, Signal::SIGKILL);
        self.state = ServiceState::Stopped;
    }

    /// Collects the exit status if the process has exited.
    pub fn try_reap(&mut self) -> Option<WaitStatus> {
        if self.state == ServiceState::Reaped {
            return None;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.state = ServiceState::Reaped;
                Some(status)
            }
            Err(_) => {
                self.state = ServiceState::Reaped;
                None
            }
        }
    }

    /// Blocks until the process exits.
    pub fn reap_blocking(&mut self) {
        if self.state == ServiceState::Reaped {
            return;
        }
        let _ = waitpid(self.pid, None);
        self.state = ServiceState::Reaped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_orders_transitions() {
        use ServiceState::*;
        assert!(Created.can_advance_to(Configured));
        assert!(Configured.can_advance_to(Keyed));
        assert!(Configured.can_advance_to(Running));
        assert!(Keyed.can_advance_to(Running));
        assert!(Running.can_advance_to(Stopped));
        assert!(Stopped.can_advance_to(Reaped));

        assert!(!Created.can_advance_to(Running));
        assert!(!Running.can_advance_to(Created));
        assert!(!Reaped.can_advance_to(Stopped));
        assert!(!Keyed.can_advance_to(Configured));
    }
}

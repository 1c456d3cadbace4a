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

//! Typed descriptor handoff.
//!
//! Every service inherits its sockets at fixed small descriptor numbers.
//! Rather than scattering magic integers, the supervisor builds a
//! [`Handoff`] record describing which abstract role fills each slot, and
//! services resolve roles back to descriptor numbers through the same
//! layout tables.

use std::os::unix::io::RawFd;

/// The abstract role an inherited descriptor fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdRole {
    /// The service's request socket.
    Request,
    /// The log socket.
    Log,
    /// The listener's accept-forward socket.
    AcceptForward,
    /// A bound listen socket.
    Listen,
    /// The protocol service's accepted-descriptor inbox.
    AcceptIn,
    /// Client socket to a data service.
    DataOut,
    /// Client socket to the random service.
    RandomOut,
    /// The control socket back to the supervisor.
    Control,
    /// The random device.
    RandomDevice,
    /// The notification service's canonization-facing client socket.
    CanonizationClient,
    /// The notification service's protocol-facing client socket.
    ProtocolClient,
}

/// The services the supervisor spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Random proxy.
    Random,
    /// Listener.
    Listener,
    /// A data service instance.
    Data,
    /// Notification service.
    Notification,
    /// Protocol boundary.
    Protocol,
    /// Auth service.
    Auth,
    /// Canonization service.
    Canonization,
    /// Attestation service.
    Attestation,
}

impl ServiceKind {
    /// The private subcommand that runs this service.
    pub fn subcommand(self) -> &'static str {
        match self {
            ServiceKind::Random => "private:random",
            ServiceKind::Listener => "private:listen",
            ServiceKind::Data => "private:data",
            ServiceKind::Notification => "private:notification",
            ServiceKind::Protocol => "private:protocol",
            ServiceKind::Auth => "private:auth",
            ServiceKind::Canonization => "private:canonization",
            ServiceKind::Attestation => "private:attestation",
        }
    }

    /// The fixed part of the service's descriptor layout; `Listen` slots
    /// repeat from the end of the table.
    pub fn fd_layout(self) -> &'static [FdRole] {
        match self {
            ServiceKind::Data => &[FdRole::Request, FdRole::Log],
            ServiceKind::Listener => &[FdRole::Log, FdRole::AcceptForward],
            ServiceKind::Protocol => &[
                FdRole::AcceptIn,
                FdRole::Log,
                FdRole::DataOut,
                FdRole::RandomOut,
                FdRole::Control,
            ],
            ServiceKind::Canonization => &[
                FdRole::Log,
                FdRole::DataOut,
                FdRole::RandomOut,
                FdRole::Control,
            ],
            ServiceKind::Attestation => &[FdRole::Log, FdRole::DataOut, FdRole::Control],
            ServiceKind::Notification => &[
                FdRole::Log,
                FdRole::CanonizationClient,
                FdRole::ProtocolClient,
            ],
            ServiceKind::Random => &[
                FdRole::RandomDevice,
                FdRole::ProtocolClient,
                FdRole::Log,
                FdRole::CanonizationClient,
            ],
            ServiceKind::Auth => &[FdRole::Request, FdRole::Log, FdRole::Control],
        }
    }

    /// Resolves a role to the descriptor number the service inherited.
    pub fn fd_for(self, role: FdRole) -> Option<RawFd> {
        self.fd_layout()
            .iter()
            .position(|candidate| *candidate == role)
            .map(|index| index as RawFd)
    }
}

/// The descriptor set the supervisor hands to one spawned service.
///
/// Entry `i` is remapped to descriptor `i` in the child; everything else is
/// closed.
#[derive(Debug, Default)]
pub struct Handoff {
    entries: Vec<(FdRole, RawFd)>,
}

impl Handoff {
    /// Creates an empty handoff record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a descriptor in the next slot.
    pub fn push(&mut self, role: FdRole, fd: RawFd) -> &mut Self {
        self.entries.push((role, fd));
        self
    }

    /// The descriptors in slot order.
    pub fn entries(&self) -> &[(FdRole, RawFd)] {
        &self.entries
    }

    /// Checks the record against the service's layout table.
    pub fn matches_layout(&self, kind: ServiceKind) -> bool {
        let layout = kind.fd_layout();
        if self.entries.len() < layout.len() {
            return false;
        }
        let fixed_ok = self
            .entries
            .iter()
            .zip(layout.iter())
            .all(|((role, _), expected)| role == expected);
        // Extra slots beyond the fixed layout must all be listen sockets.
        let extra_ok = self.entries[layout.len()..]
            .iter()
            .all(|(role, _)| *role == FdRole::Listen);
        fixed_ok && extra_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_resolve_to_spec_descriptors() {
        assert_eq!(ServiceKind::Data.fd_for(FdRole::Request), Some(0));
        assert_eq!(ServiceKind::Data.fd_for(FdRole::Log), Some(1));
        assert_eq!(ServiceKind::Protocol.fd_for(FdRole::Control), Some(4));
        assert_eq!(ServiceKind::Canonization.fd_for(FdRole::DataOut), Some(1));
        assert_eq!(ServiceKind::Attestation.fd_for(FdRole::Control), Some(2));
        assert_eq!(
            ServiceKind::Notification.fd_for(FdRole::ProtocolClient),
            Some(2)
        );
        assert_eq!(ServiceKind::Random.fd_for(FdRole::RandomDevice), Some(0));
        assert_eq!(ServiceKind::Listener.fd_for(FdRole::AcceptForward), Some(1));
    }

    #[test]
    fn handoff_layout_check() {
        let mut handoff = Handoff::new();
        handoff
            .push(FdRole::Log, 10)
            .push(FdRole::AcceptForward, 11)
            .push(FdRole::Listen, 12)
            .push(FdRole::Listen, 13);
        assert!(handoff.matches_layout(ServiceKind::Listener));
        assert!(!handoff.matches_layout(ServiceKind::Data));
    }
}

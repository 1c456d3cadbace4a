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

//! Core types and service APIs for the ledgerd blockchain agent.
//!
//! The agent is a fleet of single-purpose OS processes; this crate holds
//! everything more than one of them needs to agree on:
//!
//! - identifiers, chain sentinels and block heights ([`ids`]);
//! - the record types persisted by the data service ([`records`]);
//! - monotonically shrinking capability sets ([`caps`]);
//! - the minimal field-tagged certificate the canonization and attestation
//!   paths consume ([`cert`]);
//! - the wire-level request/response APIs of the data and notification
//!   services and the per-service control protocol ([`api`]);
//! - the agent configuration model and the privilege-separated reader
//!   stream ([`config`]);
//! - status and exit codes shared by the whole fleet ([`status`]).
//!
//! Process orchestration, the services themselves and the supervisor live in
//! the `ledgerd-node` crate; the frame codec lives in `ledgerd-ipc`.

#![warn(missing_debug_implementations, missing_docs, bare_trait_objects)]

pub mod api;
pub mod caps;
pub mod cert;
pub mod config;
pub mod ids;
pub mod records;
pub mod status;

pub use crate::{
    caps::CapabilitySet,
    ids::{Height, END_OF_CHAIN},
    status::StatusCode,
};

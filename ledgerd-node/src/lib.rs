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

//! The ledgerd service fleet and its supervisor.
//!
//! A running agent is a set of single-purpose OS processes: the data
//! services, the notification service, the attestation and canonization
//! services, the listener, the protocol boundary, the random proxy and the
//! auth service, all spawned and wired together by the supervisor. Processes
//! share nothing; every channel between them is a socket pair created by the
//! supervisor and handed down at spawn time on a well-known descriptor
//! number.
//!
//! Inside each process a single-threaded cooperative scheduler runs the
//! service's fibers; the only other OS threads are helpers that translate
//! blocking kernel calls (`sigwait`, sleeping) into socket readiness the
//! scheduler can wait on.

#![warn(missing_debug_implementations, bare_trait_objects)]

pub mod handoff;
pub mod privsep;
pub mod runtime;
pub mod services;
pub mod supervisor;

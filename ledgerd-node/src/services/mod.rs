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

//! The ledgerd services.
//!
//! Each submodule provides a service's in-process core (testable without any
//! forking) and a `service_entry` that wires the core to the descriptors the
//! supervisor handed down and runs it under the fiber runtime.

use anyhow::Context;
use tokio_util::codec::Framed;

use std::os::unix::io::{FromRawFd, RawFd};

use ledgerd_ipc::FrameCodec;

pub mod attestation;
pub mod auth;
pub mod canonization;
pub mod data;
pub mod listener;
pub mod notification;
pub mod protocol;
pub mod random;
pub mod setup;

/// Wraps an inherited descriptor as an async unix stream.
///
/// # Safety
///
/// The caller asserts that `fd` is an open stream socket this process owns
/// exclusively; the supervisor's handoff guarantees that for the well-known
/// descriptor numbers.
pub(crate) fn stream_from_fd(fd: RawFd) -> anyhow::Result<tokio::net::UnixStream> {
    // The supervisor dups the socket onto this well-known number before exec.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .with_context(|| format!("preparing inherited descriptor {}", fd))?;
    tokio::net::UnixStream::from_std(std_stream)
        .with_context(|| format!("registering inherited descriptor {}", fd))
}

/// Wraps an inherited descriptor in the frame codec.
pub(crate) fn framed_from_fd(
    fd: RawFd,
) -> anyhow::Result<Framed<tokio::net::UnixStream, FrameCodec>> {
    Ok(Framed::new(stream_from_fd(fd)?, FrameCodec::default()))
}

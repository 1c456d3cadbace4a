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

//! Typed, length-delimited IPC framing for the ledgerd service fabric.
//!
//! Every message exchanged between ledgerd services travels as a frame of the
//! form `<type:u8><length:u32 BE><payload>`. This crate provides:
//!
//! - [`Frame`], the typed message and its wire representation;
//! - blocking read/write helpers in [`sync`] for code that runs before (or
//!   outside) the cooperative scheduler — the supervisor, reader children and
//!   the signal thread;
//! - [`FrameCodec`], a [`tokio_util::codec`] codec for the cooperative
//!   variant, where an incomplete frame suspends the calling fiber instead of
//!   blocking the process;
//! - [`AuthedChannel`], the authenticated-encryption variant used on channels
//!   that cross a trust boundary.
//!
//! [`Frame`]: enum.Frame.html
//! [`FrameCodec`]: struct.FrameCodec.html
//! [`AuthedChannel`]: authed/struct.AuthedChannel.html

#![warn(missing_debug_implementations, bare_trait_objects)]

pub use crate::{
    authed::{AuthedChannel, MAC_LEN},
    codec::FrameCodec,
    error::FrameError,
    frame::{Frame, FrameType, MAX_VARIABLE_PAYLOAD},
};

pub mod authed;
pub mod codec;
pub mod error;
pub mod frame;
pub mod sync;

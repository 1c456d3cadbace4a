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

use std::io;

use thiserror::Error;

/// Errors surfaced by the framing layer.
///
/// The reader distinguishes these kinds so that callers can tell a transient
/// condition (`WouldBlock`), a peer shutdown (`PeerClosed`) and a protocol
/// violation (`BadType`, `BadSize`, `UnexpectedType`) apart; the
/// authenticated variant adds the always-fatal `Integrity` and `StaleIv`
/// kinds.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The type tag is not one of the recognized frame types.
    #[error("unrecognized frame type tag {tag:#04x}")]
    BadType {
        /// The offending tag byte.
        tag: u8,
    },

    /// The declared length exceeds the maximum for the frame type, or does
    /// not match the exact width of a fixed-width type.
    #[error("length {len} is invalid for frame type {tag:#04x}")]
    BadSize {
        /// The frame type tag.
        tag: u8,
        /// The declared payload length.
        len: usize,
    },

    /// A frame of one type arrived where another was required.
    #[error("expected frame type {expected:#04x}, got {actual:#04x}")]
    UnexpectedType {
        /// The type the caller required.
        expected: u8,
        /// The type that actually arrived.
        actual: u8,
    },

    /// The remote side shut down the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The stream ended in the middle of a frame.
    #[error("short read inside a frame")]
    ShortRead,

    /// The operation cannot complete without blocking; retry after the
    /// scheduler reports readiness.
    #[error("operation would block")]
    WouldBlock,

    /// MAC verification failed on an authenticated frame.
    #[error("message authentication failed")]
    Integrity,

    /// An authenticated frame carried an IV that is not strictly newer than
    /// the last accepted IV for this direction.
    #[error("stale iv {iv}; last accepted was {last}")]
    StaleIv {
        /// The IV carried by the rejected frame.
        iv: u64,
        /// The last IV accepted on this direction.
        last: u64,
    },

    /// A payload failed to decode as its declared type.
    #[error("malformed payload for frame type {tag:#04x}")]
    MalformedPayload {
        /// The frame type tag.
        tag: u8,
    },

    /// An underlying I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Returns `true` if the error is the cooperative would-block status.
    pub fn is_would_block(&self) -> bool {
        matches!(self, FrameError::WouldBlock)
    }
}

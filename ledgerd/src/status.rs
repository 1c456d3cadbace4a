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

//! Status and exit codes shared by the whole fleet.
//!
//! Errors that can be answered travel inline in a response's status field
//! with the correlation offset preserved; errors that cannot be answered
//! terminate the fiber or the process, and the process variety is encoded in
//! the exit code so the supervisor can log what stage failed.

use std::fmt;

/// Inline status carried in every service response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// The request succeeded.
    Success = 0,
    /// The queried entity does not exist.
    NotFound = 1,
    /// The method is not permitted by the caller's capability set.
    Unauthorized = 2,
    /// A payload size did not match the method's expectation.
    BadSize = 3,
    /// The request payload failed to decode.
    Malformed = 4,
    /// The method code is not part of the service's surface.
    BadMethod = 5,
    /// A write conflicts with already-persisted state.
    Conflict = 6,
    /// The named child context does not exist.
    BadContext = 7,
}

impl StatusCode {
    /// Decodes a wire status. Unknown values collapse to `Malformed`; peers
    /// from the same deployment never produce them.
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            0 => StatusCode::Success,
            1 => StatusCode::NotFound,
            2 => StatusCode::Unauthorized,
            3 => StatusCode::BadSize,
            4 => StatusCode::Malformed,
            5 => StatusCode::BadMethod,
            6 => StatusCode::Conflict,
            7 => StatusCode::BadContext,
            _ => StatusCode::Malformed,
        }
    }

    /// Returns `true` for `Success`.
    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "success",
            StatusCode::NotFound => "not found",
            StatusCode::Unauthorized => "unauthorized",
            StatusCode::BadSize => "bad size",
            StatusCode::Malformed => "malformed request",
            StatusCode::BadMethod => "bad method",
            StatusCode::Conflict => "conflict",
            StatusCode::BadContext => "bad child context",
        };
        f.write_str(name)
    }
}

/// Process exit codes, partitioned by failure stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean shutdown.
    Success = 0,
    /// Allocation failure with no recovery path.
    OutOfMemory = 10,
    /// A required IPC read failed.
    IpcReadFailure = 11,
    /// A required IPC write failed.
    IpcWriteFailure = 12,
    /// Dropping privileges or entering the chroot failed.
    PrivsepFailure = 13,
    /// The config reader stream was malformed.
    ConfigStreamInvalid = 14,
    /// A peer closed its socket unexpectedly.
    PeerClosed = 15,
    /// A service failed to reach its running state.
    ServiceStartFailure = 16,
}

impl ExitCode {
    /// The raw process exit status.
    pub fn code(self) -> i32 {
        self as i32
    }
}

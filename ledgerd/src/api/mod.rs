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

//! Wire-level request/response APIs of the ledgerd services.
//!
//! Each request and response travels as the payload of a single `data` IPC
//! frame. Responses are sum types whose discriminant is the method id, so a
//! decoded response carries exactly the fields its method returns.

use thiserror::Error;
use uuid::Uuid;

pub mod control;
pub mod data;
pub mod notification;

/// Errors produced while encoding or decoding API packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The packet ended before its fixed-size fields did.
    #[error("packet is truncated")]
    Truncated,
    /// The method id is not part of the service's surface.
    #[error("unknown method id {0:#06x}")]
    BadMethod(u32),
    /// A state discriminant is out of range.
    #[error("unknown transaction state {0}")]
    BadState(u32),
    /// A field has an invalid length.
    #[error("field has an invalid length")]
    BadLength,
    /// A response echoed a method the caller did not invoke.
    #[error("response method {actual:#06x} does not match request {expected:#06x}")]
    MethodMismatch {
        /// The invoked method.
        expected: u32,
        /// The echoed method.
        actual: u32,
    },
}

pub(crate) fn read_uuid(raw: &[u8], offset: usize) -> Result<Uuid, ApiError> {
    let end = offset.checked_add(16).ok_or(ApiError::Truncated)?;
    if raw.len() < end {
        return Err(ApiError::Truncated);
    }
    Uuid::from_slice(&raw[offset..end]).map_err(|_| ApiError::BadLength)
}

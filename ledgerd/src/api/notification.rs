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

//! The notification service's wire API.
//!
//! Requests are `<method:u32 BE><offset:u64 BE><payload>`; responses are
//! `<method:u32 BE><status:u32 BE><offset:u64 BE><payload>`. The offset is a
//! caller-chosen correlation value; for block assertions it also names the
//! assertion for later invalidation or cancellation.

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use std::convert::TryFrom;

use crate::{
    api::{read_uuid, ApiError},
    caps::CapabilitySet,
    status::StatusCode,
};

/// Method ids of the notification service.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NotifyMethod {
    /// Intersect the connection's capability set.
    ReduceCaps = 0x00,
    /// Set the latest block id, invalidating stale assertions.
    BlockUpdate = 0x01,
    /// Assert that a block id is the latest.
    BlockAssertion = 0x02,
    /// Cancel an assertion by offset.
    BlockAssertionCancel = 0x03,
}

impl NotifyMethod {
    /// The capability bit guarding this method.
    pub fn cap_index(self) -> usize {
        self as u32 as usize
    }
}

impl TryFrom<u32> for NotifyMethod {
    type Error = ApiError;

    fn try_from(raw: u32) -> Result<Self, ApiError> {
        match raw {
            0x00 => Ok(NotifyMethod::ReduceCaps),
            0x01 => Ok(NotifyMethod::BlockUpdate),
            0x02 => Ok(NotifyMethod::BlockAssertion),
            0x03 => Ok(NotifyMethod::BlockAssertionCancel),
            raw => Err(ApiError::BadMethod(raw)),
        }
    }
}

/// A decoded notification-service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRequest {
    /// Caller-chosen correlation offset.
    pub offset: u64,
    /// The method and its arguments.
    pub body: NotifyRequestBody,
}

/// Method-specific request arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyRequestBody {
    /// Intersect the connection's capabilities.
    ReduceCaps {
        /// The set to intersect.
        caps: CapabilitySet,
    },
    /// Set the latest block id.
    BlockUpdate {
        /// The new latest block id.
        block_id: Uuid,
    },
    /// Assert that `block_id` is the latest.
    BlockAssertion {
        /// The asserted block id.
        block_id: Uuid,
    },
    /// Cancel the assertion registered at this request's offset.
    BlockAssertionCancel,
}

impl NotifyRequest {
    /// The method id of this request.
    pub fn method(&self) -> NotifyMethod {
        match self.body {
            NotifyRequestBody::ReduceCaps { .. } => NotifyMethod::ReduceCaps,
            NotifyRequestBody::BlockUpdate { .. } => NotifyMethod::BlockUpdate,
            NotifyRequestBody::BlockAssertion { .. } => NotifyMethod::BlockAssertion,
            NotifyRequestBody::BlockAssertionCancel => NotifyMethod::BlockAssertionCancel,
        }
    }

    /// Encodes the request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        let mut header = [0_u8; 12];
        BigEndian::write_u32(&mut header[0..4], self.method() as u32);
        BigEndian::write_u64(&mut header[4..12], self.offset);
        out.extend_from_slice(&header);

        match &self.body {
            NotifyRequestBody::ReduceCaps { caps } => out.extend_from_slice(&caps.to_bytes()),
            NotifyRequestBody::BlockUpdate { block_id }
            | NotifyRequestBody::BlockAssertion { block_id } => {
                out.extend_from_slice(block_id.as_bytes())
            }
            NotifyRequestBody::BlockAssertionCancel => {}
        }
        out
    }

    /// Decodes a request packet.
    pub fn decode(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() < 12 {
            return Err(ApiError::Truncated);
        }
        let method = NotifyMethod::try_from(BigEndian::read_u32(&raw[0..4]))?;
        let offset = BigEndian::read_u64(&raw[4..12]);
        let payload = &raw[12..];

        let body = match method {
            NotifyMethod::ReduceCaps => NotifyRequestBody::ReduceCaps {
                caps: CapabilitySet::from_bytes(payload).ok_or(ApiError::BadLength)?,
            },
            NotifyMethod::BlockUpdate => NotifyRequestBody::BlockUpdate {
                block_id: read_uuid(payload, 0)?,
            },
            NotifyMethod::BlockAssertion => NotifyRequestBody::BlockAssertion {
                block_id: read_uuid(payload, 0)?,
            },
            NotifyMethod::BlockAssertionCancel => {
                if !payload.is_empty() {
                    return Err(ApiError::BadLength);
                }
                NotifyRequestBody::BlockAssertionCancel
            }
        };

        Ok(NotifyRequest { offset, body })
    }
}

/// A notification-service response.
///
/// Invalidations are responses with the `BlockAssertion` method, success
/// status, the assertion's offset, and an empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyResponse {
    /// The method this response answers.
    pub method: NotifyMethod,
    /// Inline status.
    pub status: StatusCode,
    /// The correlation offset echoed from the request.
    pub offset: u64,
    /// Method-specific payload; empty for every current method.
    pub payload: Vec<u8>,
}

impl NotifyResponse {
    /// Encodes the response for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        let mut header = [0_u8; 16];
        BigEndian::write_u32(&mut header[0..4], self.method as u32);
        BigEndian::write_u32(&mut header[4..8], self.status as u32);
        BigEndian::write_u64(&mut header[8..16], self.offset);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a response packet.
    pub fn decode(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() < 16 {
            return Err(ApiError::Truncated);
        }
        Ok(NotifyResponse {
            method: NotifyMethod::try_from(BigEndian::read_u32(&raw[0..4]))?,
            status: StatusCode::from_wire(BigEndian::read_u32(&raw[4..8])),
            offset: BigEndian::read_u64(&raw[8..16]),
            payload: raw[16..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_round_trips() {
        for request in vec![
            NotifyRequest {
                offset: 7177,
                body: NotifyRequestBody::ReduceCaps {
                    caps: CapabilitySet::with_indices(&[0, 2]),
                },
            },
            NotifyRequest {
                offset: 17,
                body: NotifyRequestBody::BlockUpdate {
                    block_id: Uuid::from_bytes([0xa4; 16]),
                },
            },
            NotifyRequest {
                offset: 7177,
                body: NotifyRequestBody::BlockAssertion {
                    block_id: Uuid::from_bytes([0xdd; 16]),
                },
            },
            NotifyRequest {
                offset: 7177,
                body: NotifyRequestBody::BlockAssertionCancel,
            },
        ] {
            let encoded = request.encode();
            assert_eq!(NotifyRequest::decode(&encoded).unwrap(), request);
        }
    }

    #[test]
    fn response_round_trips() {
        let response = NotifyResponse {
            method: NotifyMethod::BlockAssertion,
            status: StatusCode::Success,
            offset: 7177,
            payload: Vec::new(),
        };
        let encoded = response.encode();
        assert_eq!(NotifyResponse::decode(&encoded).unwrap(), response);
    }

    #[test]
    fn unauthorized_response_echoes_offset() {
        let response = NotifyResponse {
            method: NotifyMethod::BlockUpdate,
            status: StatusCode::Unauthorized,
            offset: 7177,
            payload: Vec::new(),
        };
        let decoded = NotifyResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded.status, StatusCode::Unauthorized);
        assert_eq!(decoded.offset, 7177);
    }

    #[test]
    fn cancel_with_payload_is_rejected() {
        let mut raw = NotifyRequest {
            offset: 1,
            body: NotifyRequestBody::BlockAssertionCancel,
        }
        .encode();
        raw.push(0);
        assert_eq!(NotifyRequest::decode(&raw), Err(ApiError::BadLength));
    }
}

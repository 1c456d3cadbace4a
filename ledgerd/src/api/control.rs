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

//! The control protocol spoken on each service's control socket.
//!
//! After spawning a service, the supervisor configures it, hands it key
//! material where applicable, and finally starts it; the service acknowledges
//! each command before the supervisor proceeds. Requests are
//! `<command:u32 BE><body>`, responses `<command:u32 BE><status:u32 BE>`.

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use std::convert::TryFrom;

use crate::{
    api::{read_uuid, ApiError},
    caps::CapabilitySet,
    status::StatusCode,
};

/// Control command ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlCommandId {
    /// Install the service's configuration.
    ConfigSet = 0x01,
    /// Install the service's private key.
    PrivateKeySet = 0x02,
    /// Register an authorized public entity.
    EntityAdd = 0x03,
    /// Begin normal operation.
    Start = 0x04,
}

impl TryFrom<u32> for ControlCommandId {
    type Error = ApiError;

    fn try_from(raw: u32) -> Result<Self, ApiError> {
        match raw {
            0x01 => Ok(ControlCommandId::ConfigSet),
            0x02 => Ok(ControlCommandId::PrivateKeySet),
            0x03 => Ok(ControlCommandId::EntityAdd),
            0x04 => Ok(ControlCommandId::Start),
            raw => Err(ApiError::BadMethod(raw)),
        }
    }
}

/// Per-service runtime configuration delivered over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Canonization tick, in milliseconds.
    pub block_max_milliseconds: u64,
    /// Cap on transactions per block.
    pub block_max_transactions: u64,
    /// Attestation tick, in milliseconds.
    pub attestation_tick_milliseconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            block_max_milliseconds: 5000,
            block_max_transactions: 500,
            attestation_tick_milliseconds: 5000,
        }
    }
}

/// A control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Install configuration.
    ConfigSet(ServiceConfig),
    /// Install the service's signing identity.
    PrivateKeySet {
        /// The entity id the service signs as.
        entity_id: Uuid,
        /// Raw ed25519 public key (32 bytes).
        public_key: Vec<u8>,
        /// Raw ed25519 secret key (64 bytes).
        secret_key: Vec<u8>,
    },
    /// Register an authorized public entity and its grants.
    EntityAdd {
        /// The entity id.
        entity_id: Uuid,
        /// Raw ed25519 public key (32 bytes).
        public_key: Vec<u8>,
        /// The entity's capability set.
        caps: CapabilitySet,
    },
    /// Begin normal operation.
    Start,
}

impl ControlCommand {
    /// The command id.
    pub fn id(&self) -> ControlCommandId {
        match self {
            ControlCommand::ConfigSet(_) => ControlCommandId::ConfigSet,
            ControlCommand::PrivateKeySet { .. } => ControlCommandId::PrivateKeySet,
            ControlCommand::EntityAdd { .. } => ControlCommandId::EntityAdd,
            ControlCommand::Start => ControlCommandId::Start,
        }
    }

    /// Encodes the command for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 4];
        BigEndian::write_u32(&mut out[0..4], self.id() as u32);

        match self {
            ControlCommand::ConfigSet(config) => {
                let mut raw = [0_u8; 24];
                BigEndian::write_u64(&mut raw[0..8], config.block_max_milliseconds);
                BigEndian::write_u64(&mut raw[8..16], config.block_max_transactions);
                BigEndian::write_u64(&mut raw[16..24], config.attestation_tick_milliseconds);
                out.extend_from_slice(&raw);
            }
            ControlCommand::PrivateKeySet {
                entity_id,
                public_key,
                secret_key,
            } => {
                out.extend_from_slice(entity_id.as_bytes());
                let mut raw = [0_u8; 8];
                BigEndian::write_u32(&mut raw[0..4], public_key.len() as u32);
                BigEndian::write_u32(&mut raw[4..8], secret_key.len() as u32);
                out.extend_from_slice(&raw);
                out.extend_from_slice(public_key);
                out.extend_from_slice(secret_key);
            }
            ControlCommand::EntityAdd {
                entity_id,
                public_key,
                caps,
            } => {
                out.extend_from_slice(entity_id.as_bytes());
                let mut raw = [0_u8; 4];
                BigEndian::write_u32(&mut raw, public_key.len() as u32);
                out.extend_from_slice(&raw);
                out.extend_from_slice(public_key);
                out.extend_from_slice(&caps.to_bytes());
            }
            ControlCommand::Start => {}
        }
        out
    }

    /// Decodes a command packet.
    pub fn decode(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() < 4 {
            return Err(ApiError::Truncated);
        }
        let id = ControlCommandId::try_from(BigEndian::read_u32(&raw[0..4]))?;
        let body = &raw[4..];

        match id {
            ControlCommandId::ConfigSet => {
                if body.len() != 24 {
                    return Err(ApiError::BadLength);
                }
                Ok(ControlCommand::ConfigSet(ServiceConfig {
                    block_max_milliseconds: BigEndian::read_u64(&body[0..8]),
                    block_max_transactions: BigEndian::read_u64(&body[8..16]),
                    attestation_tick_milliseconds: BigEndian::read_u64(&body[16..24]),
                }))
            }
            ControlCommandId::PrivateKeySet => {
                if body.len() < 24 {
                    return Err(ApiError::Truncated);
                }
                let entity_id = read_uuid(body, 0)?;
                let pk_len = BigEndian::read_u32(&body[16..20]) as usize;
                let sk_len = BigEndian::read_u32(&body[20..24]) as usize;
                if body.len() != 24 + pk_len + sk_len {
                    return Err(ApiError::BadLength);
                }
                Ok(ControlCommand::PrivateKeySet {
                    entity_id,
                    public_key: body[24..24 + pk_len].to_vec(),
                    secret_key: body[24 + pk_len..].to_vec(),
                })
            }
            ControlCommandId::EntityAdd => {
                if body.len() < 20 {
                    return Err(ApiError::Truncated);
                }
                let entity_id = read_uuid(body, 0)?;
                let pk_len = BigEndian::read_u32(&body[16..20]) as usize;
                if body.len() < 20 + pk_len {
                    return Err(ApiError::Truncated);
                }
                let caps = CapabilitySet::from_bytes(&body[20 + pk_len..])
                    .ok_or(ApiError::BadLength)?;
                Ok(ControlCommand::EntityAdd {
                    entity_id,
                    public_key: body[20..20 + pk_len].to_vec(),
                    caps,
                })
            }
            ControlCommandId::Start => {
                if !body.is_empty() {
                    return Err(ApiError::BadLength);
                }
                Ok(ControlCommand::Start)
            }
        }
    }
}

/// A control acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlAck {
    /// The acknowledged command.
    pub command: ControlCommandId,
    /// Inline status.
    pub status: StatusCode,
}

impl ControlAck {
    /// Encodes the acknowledgement for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 8];
        BigEndian::write_u32(&mut out[0..4], self.command as u32);
        BigEndian::write_u32(&mut out[4..8], self.status as u32);
        out
    }

    /// Decodes an acknowledgement packet.
    pub fn decode(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() != 8 {
            return Err(ApiError::Truncated);
        }
        Ok(ControlAck {
            command: ControlCommandId::try_from(BigEndian::read_u32(&raw[0..4]))?,
            status: StatusCode::from_wire(BigEndian::read_u32(&raw[4..8])),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn command_round_trips() {
        for command in vec![
            ControlCommand::ConfigSet(ServiceConfig {
                block_max_milliseconds: 1,
                block_max_transactions: 10,
                attestation_tick_milliseconds: 5000,
            }),
            ControlCommand::PrivateKeySet {
                entity_id: Uuid::from_bytes([0x42; 16]),
                public_key: vec![1; 32],
                secret_key: vec![2; 64],
            },
            ControlCommand::EntityAdd {
                entity_id: Uuid::from_bytes([0x43; 16]),
                public_key: vec![3; 32],
                caps: CapabilitySet::with_indices(&[1, 2]),
            },
            ControlCommand::Start,
        ] {
            let encoded = command.encode();
            assert_eq!(ControlCommand::decode(&encoded).unwrap(), command);
        }
    }

    #[test]
    fn ack_round_trips() {
        let ack = ControlAck {
            command: ControlCommandId::Start,
            status: StatusCode::Success,
        };
        assert_eq!(ControlAck::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn start_with_body_is_rejected() {
        let mut raw = ControlCommand::Start.encode();
        raw.push(9);
        assert_eq!(ControlCommand::decode(&raw), Err(ApiError::BadLength));
    }
}

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

//! The data service's method-coded request surface.
//!
//! A request packet is `<method:u32 BE><child:u32 BE><body>`; the child
//! context id is ignored by the two root-context methods. A response packet
//! is `<method:u32 BE><offset:u32 BE><status:u32 BE><payload>` where the
//! offset echoes the child context id of the request, so callers can
//! correlate responses even when the status is an error.

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use std::convert::TryFrom;

use crate::{
    api::{read_uuid, ApiError},
    caps::CapabilitySet,
    ids::Height,
    records::{ArtifactRecord, BlockNode, TransactionNode, TransactionState},
    status::StatusCode,
};

/// Method ids of the data service.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataMethod {
    /// Create the root context. First request on a fresh connection.
    RootContextCreate = 0x00,
    /// Intersect the root context's capability set.
    RootContextReduceCaps = 0x01,
    /// Create a child context with a subset of the root capabilities.
    ChildContextCreate = 0x02,
    /// Close a child context.
    ChildContextClose = 0x03,
    /// Read a global setting.
    GlobalSettingGet = 0x10,
    /// Write a global setting.
    GlobalSettingSet = 0x11,
    /// Enqueue a submitted transaction.
    TransactionSubmit = 0x20,
    /// Read the head of the process queue.
    TransactionGetFirst = 0x21,
    /// Read a pending transaction by id.
    TransactionGet = 0x22,
    /// Remove and unlink a pending transaction.
    TransactionDrop = 0x23,
    /// Advance a pending transaction from submitted to attested.
    TransactionPromote = 0x24,
    /// Read an artifact record.
    ArtifactGet = 0x30,
    /// Persist a canonized block.
    BlockMake = 0x40,
    /// Read a block by id.
    BlockGet = 0x41,
    /// Resolve a height to a block id.
    BlockIdByHeightGet = 0x42,
    /// Read the latest-block pointer.
    LatestBlockIdGet = 0x43,
    /// Read a canonized transaction by id.
    CanonizedTransactionGet = 0x50,
}

impl DataMethod {
    /// The capability bit guarding this method.
    pub fn cap_index(self) -> usize {
        match self {
            DataMethod::RootContextCreate => 0,
            DataMethod::RootContextReduceCaps => 1,
            DataMethod::ChildContextCreate => 2,
            DataMethod::ChildContextClose => 3,
            DataMethod::GlobalSettingGet => 4,
            DataMethod::GlobalSettingSet => 5,
            DataMethod::TransactionSubmit => 6,
            DataMethod::TransactionGetFirst => 7,
            DataMethod::TransactionGet => 8,
            DataMethod::TransactionDrop => 9,
            DataMethod::TransactionPromote => 10,
            DataMethod::ArtifactGet => 11,
            DataMethod::BlockMake => 12,
            DataMethod::BlockGet => 13,
            DataMethod::BlockIdByHeightGet => 14,
            DataMethod::LatestBlockIdGet => 15,
            DataMethod::CanonizedTransactionGet => 16,
        }
    }
}

/// Well-known verb ids carried by public-entity capability triples.
pub mod verbs {
    use uuid::Uuid;

    /// Grants transaction submission.
    pub const TRANSACTION_SUBMIT: Uuid = Uuid::from_bytes([
        0x1c, 0x79, 0x20, 0x0e, 0x70, 0x8f, 0x4b, 0xd5, 0x96, 0x1f, 0x03, 0x11, 0xb8, 0x8a, 0x0f,
        0x01,
    ]);
    /// Grants pending and canonized transaction reads.
    pub const TRANSACTION_READ: Uuid = Uuid::from_bytes([
        0x1c, 0x79, 0x20, 0x0e, 0x70, 0x8f, 0x4b, 0xd5, 0x96, 0x1f, 0x03, 0x11, 0xb8, 0x8a, 0x0f,
        0x02,
    ]);
    /// Grants artifact reads.
    pub const ARTIFACT_READ: Uuid = Uuid::from_bytes([
        0x1c, 0x79, 0x20, 0x0e, 0x70, 0x8f, 0x4b, 0xd5, 0x96, 0x1f, 0x03, 0x11, 0xb8, 0x8a, 0x0f,
        0x03,
    ]);
    /// Grants block reads, including latest-block queries and assertions.
    pub const BLOCK_READ: Uuid = Uuid::from_bytes([
        0x1c, 0x79, 0x20, 0x0e, 0x70, 0x8f, 0x4b, 0xd5, 0x96, 0x1f, 0x03, 0x11, 0xb8, 0x8a, 0x0f,
        0x04,
    ]);
}

/// Maps an entity's (subject, verb, object) grants onto the data-service
/// method bitset the rest of the fleet checks against.
pub fn caps_from_triples(triples: &[crate::caps::CapabilityTriple]) -> CapabilitySet {
    let mut indices = vec![DataMethod::ChildContextClose.cap_index()];
    for triple in triples {
        if triple.verb == verbs::TRANSACTION_SUBMIT {
            indices.push(DataMethod::TransactionSubmit.cap_index());
        } else if triple.verb == verbs::TRANSACTION_READ {
            indices.push(DataMethod::TransactionGet.cap_index());
            indices.push(DataMethod::CanonizedTransactionGet.cap_index());
        } else if triple.verb == verbs::ARTIFACT_READ {
            indices.push(DataMethod::ArtifactGet.cap_index());
        } else if triple.verb == verbs::BLOCK_READ {
            indices.push(DataMethod::BlockGet.cap_index());
            indices.push(DataMethod::BlockIdByHeightGet.cap_index());
            indices.push(DataMethod::LatestBlockIdGet.cap_index());
        }
    }
    CapabilitySet::with_indices(&indices)
}

impl TryFrom<u32> for DataMethod {
    type Error = ApiError;

    fn try_from(raw: u32) -> Result<Self, ApiError> {
        let method = match raw {
            0x00 => DataMethod::RootContextCreate,
            0x01 => DataMethod::RootContextReduceCaps,
            0x02 => DataMethod::ChildContextCreate,
            0x03 => DataMethod::ChildContextClose,
            0x10 => DataMethod::GlobalSettingGet,
            0x11 => DataMethod::GlobalSettingSet,
            0x20 => DataMethod::TransactionSubmit,
            0x21 => DataMethod::TransactionGetFirst,
            0x22 => DataMethod::TransactionGet,
            0x23 => DataMethod::TransactionDrop,
            0x24 => DataMethod::TransactionPromote,
            0x30 => DataMethod::ArtifactGet,
            0x40 => DataMethod::BlockMake,
            0x41 => DataMethod::BlockGet,
            0x42 => DataMethod::BlockIdByHeightGet,
            0x43 => DataMethod::LatestBlockIdGet,
            0x50 => DataMethod::CanonizedTransactionGet,
            raw => return Err(ApiError::BadMethod(raw)),
        };
        Ok(method)
    }
}

/// A decoded data-service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// The child context the request runs under; zero for root methods.
    pub child: u32,
    /// The method and its arguments.
    pub body: DataRequestBody,
}

/// Method-specific request arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRequestBody {
    /// Create the root context.
    RootContextCreate,
    /// Intersect the root capability set.
    RootContextReduceCaps {
        /// The set to intersect.
        caps: CapabilitySet,
    },
    /// Create a child context.
    ChildContextCreate {
        /// The requested capability set.
        caps: CapabilitySet,
    },
    /// Close the child context named in the header.
    ChildContextClose,
    /// Read a global setting.
    GlobalSettingGet {
        /// Well-known settings key.
        key: u64,
    },
    /// Write a global setting.
    GlobalSettingSet {
        /// Well-known settings key.
        key: u64,
        /// Raw value bytes.
        value: Vec<u8>,
    },
    /// Enqueue a submitted transaction.
    TransactionSubmit {
        /// Transaction id.
        txn_id: Uuid,
        /// Artifact id.
        artifact_id: Uuid,
        /// The signed transaction certificate.
        cert: Vec<u8>,
    },
    /// Read the head of the process queue.
    TransactionGetFirst,
    /// Read a pending transaction.
    TransactionGet {
        /// Transaction id.
        txn_id: Uuid,
    },
    /// Remove and unlink a pending transaction.
    TransactionDrop {
        /// Transaction id.
        txn_id: Uuid,
    },
    /// Promote a pending transaction to attested.
    TransactionPromote {
        /// Transaction id.
        txn_id: Uuid,
    },
    /// Read an artifact record.
    ArtifactGet {
        /// Artifact id.
        artifact_id: Uuid,
    },
    /// Persist a canonized block.
    BlockMake {
        /// The new block id.
        block_id: Uuid,
        /// The signed block certificate.
        cert: Vec<u8>,
    },
    /// Read a block.
    BlockGet {
        /// Block id.
        block_id: Uuid,
    },
    /// Resolve a height to a block id.
    BlockIdByHeightGet {
        /// Block height.
        height: Height,
    },
    /// Read the latest-block pointer.
    LatestBlockIdGet,
    /// Read a canonized transaction.
    CanonizedTransactionGet {
        /// Transaction id.
        txn_id: Uuid,
    },
}

impl DataRequest {
    /// The method id of this request.
    pub fn method(&self) -> DataMethod {
        match self.body {
            DataRequestBody::RootContextCreate => DataMethod::RootContextCreate,
            DataRequestBody::RootContextReduceCaps { .. } => DataMethod::RootContextReduceCaps,
            DataRequestBody::ChildContextCreate { .. } => DataMethod::ChildContextCreate,
            DataRequestBody::ChildContextClose => DataMethod::ChildContextClose,
            DataRequestBody::GlobalSettingGet { .. } => DataMethod::GlobalSettingGet,
            DataRequestBody::GlobalSettingSet { .. } => DataMethod::GlobalSettingSet,
            DataRequestBody::TransactionSubmit { .. } => DataMethod::TransactionSubmit,
            DataRequestBody::TransactionGetFirst => DataMethod::TransactionGetFirst,
            DataRequestBody::TransactionGet { .. } => DataMethod::TransactionGet,
            DataRequestBody::TransactionDrop { .. } => DataMethod::TransactionDrop,
            DataRequestBody::TransactionPromote { .. } => DataMethod::TransactionPromote,
            DataRequestBody::ArtifactGet { .. } => DataMethod::ArtifactGet,
            DataRequestBody::BlockMake { .. } => DataMethod::BlockMake,
            DataRequestBody::BlockGet { .. } => DataMethod::BlockGet,
            DataRequestBody::BlockIdByHeightGet { .. } => DataMethod::BlockIdByHeightGet,
            DataRequestBody::LatestBlockIdGet => DataMethod::LatestBlockIdGet,
            DataRequestBody::CanonizedTransactionGet { .. } => DataMethod::CanonizedTransactionGet,
        }
    }

    /// Encodes the request for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        let mut header = [0_u8; 8];
        BigEndian::write_u32(&mut header[0..4], self.method() as u32);
        BigEndian::write_u32(&mut header[4..8], self.child);
        out.extend_from_slice(&header);

        match &self.body {
            DataRequestBody::RootContextCreate
            | DataRequestBody::ChildContextClose
            | DataRequestBody::TransactionGetFirst
            | DataRequestBody::LatestBlockIdGet => {}
            DataRequestBody::RootContextReduceCaps { caps }
            | DataRequestBody::ChildContextCreate { caps } => {
                out.extend_from_slice(&caps.to_bytes());
            }
            DataRequestBody::GlobalSettingGet { key } => {
                let mut raw = [0_u8; 8];
                BigEndian::write_u64(&mut raw, *key);
                out.extend_from_slice(&raw);
            }
            DataRequestBody::GlobalSettingSet { key, value } => {
                let mut raw = [0_u8; 8];
                BigEndian::write_u64(&mut raw, *key);
                out.extend_from_slice(&raw);
                out.extend_from_slice(value);
            }
            DataRequestBody::TransactionSubmit {
                txn_id,
                artifact_id,
                cert,
            } => {
                out.extend_from_slice(txn_id.as_bytes());
                out.extend_from_slice(artifact_id.as_bytes());
                out.extend_from_slice(cert);
            }
            DataRequestBody::TransactionGet { txn_id }
            | DataRequestBody::TransactionDrop { txn_id }
            | DataRequestBody::TransactionPromote { txn_id }
            | DataRequestBody::CanonizedTransactionGet { txn_id } => {
                out.extend_from_slice(txn_id.as_bytes());
            }
            DataRequestBody::ArtifactGet { artifact_id } => {
                out.extend_from_slice(artifact_id.as_bytes());
            }
            DataRequestBody::BlockMake { block_id, cert } => {
                out.extend_from_slice(block_id.as_bytes());
                out.extend_from_slice(cert);
            }
            DataRequestBody::BlockGet { block_id } => {
                out.extend_from_slice(block_id.as_bytes());
            }
            DataRequestBody::BlockIdByHeightGet { height } => {
                let mut raw = [0_u8; 8];
                BigEndian::write_u64(&mut raw, height.0);
                out.extend_from_slice(&raw);
            }
        }
        out
    }

    /// Decodes a request packet.
    pub fn decode(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() < 8 {
            return Err(ApiError::Truncated);
        }
        let method = DataMethod::try_from(BigEndian::read_u32(&raw[0..4]))?;
        let child = BigEndian::read_u32(&raw[4..8]);
        let body = &raw[8..];

        let parsed = match method {
            DataMethod::RootContextCreate => DataRequestBody::RootContextCreate,
            DataMethod::RootContextReduceCaps => DataRequestBody::RootContextReduceCaps {
                caps: CapabilitySet::from_bytes(body).ok_or(ApiError::BadLength)?,
            },
            DataMethod::ChildContextCreate => DataRequestBody::ChildContextCreate {
                caps: CapabilitySet::from_bytes(body).ok_or(ApiError::BadLength)?,
            },
            DataMethod::ChildContextClose => DataRequestBody::ChildContextClose,
            DataMethod::GlobalSettingGet => {
                if body.len() != 8 {
                    return Err(ApiError::BadLength);
                }
                DataRequestBody::GlobalSettingGet {
                    key: BigEndian::read_u64(body),
                }
            }
            DataMethod::GlobalSettingSet => {
                if body.len() < 8 {
                    return Err(ApiError::Truncated);
                }
                DataRequestBody::GlobalSettingSet {
                    key: BigEndian::read_u64(&body[..8]),
                    value: body[8..].to_vec(),
                }
            }
            DataMethod::TransactionSubmit => {
                if body.len() < 32 {
                    return Err(ApiError::Truncated);
                }
                DataRequestBody::TransactionSubmit {
                    txn_id: read_uuid(body, 0)?,
                    artifact_id: read_uuid(body, 16)?,
                    cert: body[32..].to_vec(),
                }
            }
            DataMethod::TransactionGetFirst => DataRequestBody::TransactionGetFirst,
            DataMethod::TransactionGet => DataRequestBody::TransactionGet {
                txn_id: read_uuid(body, 0)?,
            },
            DataMethod::TransactionDrop => DataRequestBody::TransactionDrop {
                txn_id: read_uuid(body, 0)?,
            },
            DataMethod::TransactionPromote => DataRequestBody::TransactionPromote {
                txn_id: read_uuid(body, 0)?,
            },
            DataMethod::ArtifactGet => DataRequestBody::ArtifactGet {
                artifact_id: read_uuid(body, 0)?,
            },
            DataMethod::BlockMake => {
                if body.len() < 16 {
                    return Err(ApiError::Truncated);
                }
                DataRequestBody::BlockMake {
                    block_id: read_uuid(body, 0)?,
                    cert: body[16..].to_vec(),
                }
            }
            DataMethod::BlockGet => DataRequestBody::BlockGet {
                block_id: read_uuid(body, 0)?,
            },
            DataMethod::BlockIdByHeightGet => {
                if body.len() != 8 {
                    return Err(ApiError::BadLength);
                }
                DataRequestBody::BlockIdByHeightGet {
                    height: Height(BigEndian::read_u64(body)),
                }
            }
            DataMethod::LatestBlockIdGet => DataRequestBody::LatestBlockIdGet,
            DataMethod::CanonizedTransactionGet => DataRequestBody::CanonizedTransactionGet {
                txn_id: read_uuid(body, 0)?,
            },
        };

        Ok(DataRequest {
            child,
            body: parsed,
        })
    }
}

/// A decoded data-service response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    /// The method this response answers.
    pub method: DataMethod,
    /// The correlation offset echoed from the request.
    pub offset: u32,
    /// Inline status.
    pub status: StatusCode,
    /// Method-specific payload; `Empty` whenever `status` is not success.
    pub body: DataResponseBody,
}

/// Method-specific response payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataResponseBody {
    /// No payload.
    Empty,
    /// A child context id.
    Child(u32),
    /// A global-setting value.
    Value(Vec<u8>),
    /// A pending or canonized transaction node.
    Transaction(TransactionNode),
    /// An artifact record.
    Artifact(ArtifactRecord),
    /// A block node.
    Block(BlockNode),
    /// A bare block id.
    BlockId(Uuid),
}

impl DataResponse {
    /// Encodes the response for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        let mut header = [0_u8; 12];
        BigEndian::write_u32(&mut header[0..4], self.method as u32);
        BigEndian::write_u32(&mut header[4..8], self.offset);
        BigEndian::write_u32(&mut header[8..12], self.status as u32);
        out.extend_from_slice(&header);

        match &self.body {
            DataResponseBody::Empty => {}
            DataResponseBody::Child(child) => {
                let mut raw = [0_u8; 4];
                BigEndian::write_u32(&mut raw, *child);
                out.extend_from_slice(&raw);
            }
            DataResponseBody::Value(value) => out.extend_from_slice(value),
            DataResponseBody::Transaction(node) => {
                out.extend_from_slice(node.id.as_bytes());
                out.extend_from_slice(node.prev.as_bytes());
                out.extend_from_slice(node.next.as_bytes());
                out.extend_from_slice(node.artifact_id.as_bytes());
                let mut raw = [0_u8; 12];
                BigEndian::write_u32(&mut raw[0..4], node.state as u32);
                BigEndian::write_u64(&mut raw[4..12], node.cert.len() as u64);
                out.extend_from_slice(&raw);
                out.extend_from_slice(&node.cert);
            }
            DataResponseBody::Artifact(record) => {
                out.extend_from_slice(record.artifact_id.as_bytes());
                out.extend_from_slice(record.first_txn.as_bytes());
                out.extend_from_slice(record.latest_txn.as_bytes());
                let mut raw = [0_u8; 20];
                BigEndian::write_u64(&mut raw[0..8], record.first_height.0);
                BigEndian::write_u64(&mut raw[8..16], record.latest_height.0);
                BigEndian::write_u32(&mut raw[16..20], record.latest_state as u32);
                out.extend_from_slice(&raw);
            }
            DataResponseBody::Block(node) => {
                out.extend_from_slice(node.block_id.as_bytes());
                out.extend_from_slice(node.prev.as_bytes());
                out.extend_from_slice(node.next.as_bytes());
                out.extend_from_slice(node.first_txn.as_bytes());
                let mut raw = [0_u8; 16];
                BigEndian::write_u64(&mut raw[0..8], node.height.0);
                BigEndian::write_u64(&mut raw[8..16], node.cert.len() as u64);
                out.extend_from_slice(&raw);
                out.extend_from_slice(&node.cert);
            }
            DataResponseBody::BlockId(id) => out.extend_from_slice(id.as_bytes()),
        }
        out
    }

    /// Decodes a response packet.
    pub fn decode(raw: &[u8]) -> Result<Self, ApiError> {
        if raw.len() < 12 {
            return Err(ApiError::Truncated);
        }
        let method = DataMethod::try_from(BigEndian::read_u32(&raw[0..4]))?;
        let offset = BigEndian::read_u32(&raw[4..8]);
        let status = StatusCode::from_wire(BigEndian::read_u32(&raw[8..12]));
        let body = &raw[12..];

        let parsed = if !status.is_success() {
            DataResponseBody::Empty
        } else {
            match method {
                DataMethod::RootContextCreate
                | DataMethod::RootContextReduceCaps
                | DataMethod::GlobalSettingSet
                | DataMethod::TransactionSubmit
                | DataMethod::TransactionDrop
                | DataMethod::TransactionPromote
                | DataMethod::BlockMake => DataResponseBody::Empty,
                DataMethod::ChildContextCreate | DataMethod::ChildContextClose => {
                    if body.len() != 4 {
                        return Err(ApiError::BadLength);
                    }
                    DataResponseBody::Child(BigEndian::read_u32(body))
                }
                DataMethod::GlobalSettingGet => DataResponseBody::Value(body.to_vec()),
                DataMethod::TransactionGetFirst
                | DataMethod::TransactionGet
                | DataMethod::CanonizedTransactionGet => {
                    DataResponseBody::Transaction(decode_transaction_node(body)?)
                }
                DataMethod::ArtifactGet => DataResponseBody::Artifact(decode_artifact(body)?),
                DataMethod::BlockGet => DataResponseBody::Block(decode_block_node(body)?),
                DataMethod::BlockIdByHeightGet | DataMethod::LatestBlockIdGet => {
                    DataResponseBody::BlockId(read_uuid(body, 0)?)
                }
            }
        };

        Ok(DataResponse {
            method,
            offset,
            status,
            body: parsed,
        })
    }
}

fn decode_transaction_node(raw: &[u8]) -> Result<TransactionNode, ApiError> {
    if raw.len() < 76 {
        return Err(ApiError::Truncated);
    }
    let state_raw = BigEndian::read_u32(&raw[64..68]);
    let cert_len = BigEndian::read_u64(&raw[68..76]) as usize;
    if raw.len() != 76 + cert_len {
        return Err(ApiError::BadLength);
    }
    Ok(TransactionNode {
        id: read_uuid(raw, 0)?,
        prev: read_uuid(raw, 16)?,
        next: read_uuid(raw, 32)?,
        artifact_id: read_uuid(raw, 48)?,
        state: TransactionState::from_wire(state_raw).ok_or(ApiError::BadState(state_raw))?,
        cert: raw[76..].to_vec(),
    })
}

fn decode_artifact(raw: &[u8]) -> Result<ArtifactRecord, ApiError> {
    if raw.len() != 68 {
        return Err(ApiError::Truncated);
    }
    let state_raw = BigEndian::read_u32(&raw[64..68]);
    Ok(ArtifactRecord {
        artifact_id: read_uuid(raw, 0)?,
        first_txn: read_uuid(raw, 16)?,
        latest_txn: read_uuid(raw, 32)?,
        first_height: Height(BigEndian::read_u64(&raw[48..56])),
        latest_height: Height(BigEndian::read_u64(&raw[56..64])),
        latest_state: TransactionState::from_wire(state_raw).ok_or(ApiError::BadState(state_raw))?,
    })
}

fn decode_block_node(raw: &[u8]) -> Result<BlockNode, ApiError> {
    if raw.len() < 80 {
        return Err(ApiError::Truncated);
    }
    let cert_len = BigEndian::read_u64(&raw[72..80]) as usize;
    if raw.len() != 80 + cert_len {
        return Err(ApiError::BadLength);
    }
    Ok(BlockNode {
        block_id: read_uuid(raw, 0)?,
        prev: read_uuid(raw, 16)?,
        next: read_uuid(raw, 32)?,
        first_txn: read_uuid(raw, 48)?,
        height: Height(BigEndian::read_u64(&raw[64..72])),
        cert: raw[80..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ids::END_OF_CHAIN;

    fn round_trip_request(request: DataRequest) {
        let encoded = request.encode();
        assert_eq!(DataRequest::decode(&encoded).unwrap(), request);
    }

    fn round_trip_response(response: DataResponse) {
        let encoded = response.encode();
        assert_eq!(DataResponse::decode(&encoded).unwrap(), response);
    }

    #[test]
    fn request_round_trips() {
        round_trip_request(DataRequest {
            child: 0,
            body: DataRequestBody::RootContextCreate,
        });
        round_trip_request(DataRequest {
            child: 3,
            body: DataRequestBody::ChildContextCreate {
                caps: CapabilitySet::with_indices(&[7, 8, 13]),
            },
        });
        round_trip_request(DataRequest {
            child: 9,
            body: DataRequestBody::TransactionSubmit {
                txn_id: Uuid::from_bytes([0xb8; 16]),
                artifact_id: Uuid::from_bytes([0xf2; 16]),
                cert: vec![1, 2, 3],
            },
        });
        round_trip_request(DataRequest {
            child: 9,
            body: DataRequestBody::BlockIdByHeightGet { height: Height(42) },
        });
    }

    #[test]
    fn response_round_trips() {
        round_trip_response(DataResponse {
            method: DataMethod::TransactionGetFirst,
            offset: 4,
            status: StatusCode::Success,
            body: DataResponseBody::Transaction(TransactionNode {
                id: Uuid::from_bytes([0xb8; 16]),
                prev: Uuid::nil(),
                next: END_OF_CHAIN,
                artifact_id: Uuid::from_bytes([0xf2; 16]),
                state: TransactionState::Submitted,
                cert: vec![0xde, 0xad],
            }),
        });
        round_trip_response(DataResponse {
            method: DataMethod::ArtifactGet,
            offset: 1,
            status: StatusCode::Success,
            body: DataResponseBody::Artifact(ArtifactRecord {
                artifact_id: Uuid::from_bytes([0xf2; 16]),
                first_txn: Uuid::from_bytes([0xb8; 16]),
                latest_txn: Uuid::from_bytes([0xb9; 16]),
                first_height: Height(1),
                latest_height: Height(3),
                latest_state: TransactionState::Canonized,
            }),
        });
        round_trip_response(DataResponse {
            method: DataMethod::LatestBlockIdGet,
            offset: 0,
            status: StatusCode::Success,
            body: DataResponseBody::BlockId(Uuid::from_bytes([0xa4; 16])),
        });
    }

    #[test]
    fn error_response_has_empty_body_but_keeps_offset() {
        let response = DataResponse {
            method: DataMethod::TransactionGetFirst,
            offset: 17,
            status: StatusCode::NotFound,
            body: DataResponseBody::Empty,
        };
        let decoded = DataResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded.offset, 17);
        assert_eq!(decoded.status, StatusCode::NotFound);
        assert_eq!(decoded.body, DataResponseBody::Empty);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut raw = vec![0_u8; 8];
        BigEndian::write_u32(&mut raw[0..4], 0x7777);
        assert_eq!(DataRequest::decode(&raw), Err(ApiError::BadMethod(0x7777)));
    }

    #[test]
    fn truncated_node_is_rejected() {
        let mut raw = vec![0_u8; 12];
        BigEndian::write_u32(&mut raw[0..4], DataMethod::TransactionGet as u32);
        raw.extend_from_slice(&[0; 10]);
        assert_eq!(DataResponse::decode(&raw), Err(ApiError::Truncated));
    }
}

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

//! Record types persisted by the data service.
//!
//! These are the wire-and-storage shapes of the three tables the
//! coordination triangle works against: the pending process queue, the
//! artifact index and the block chain. Integer fields travel big-endian;
//! encode/decode for the wire lives with the corresponding API payloads in
//! [`crate::api::data`].

use uuid::Uuid;

use crate::ids::Height;

/// Lifecycle state of a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TransactionState {
    /// Accepted from a client, not yet attested.
    Submitted = 0,
    /// Passed field, sequence and uniqueness checks.
    Attested = 1,
    /// Included in a canonized block.
    Canonized = 2,
}

impl TransactionState {
    /// Decodes a wire state value.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(TransactionState::Submitted),
            1 => Some(TransactionState::Attested),
            2 => Some(TransactionState::Canonized),
            _ => None,
        }
    }
}

/// A transaction node in the per-artifact process queue.
///
/// `prev` names the predecessor in the same artifact's chain (nil for a
/// create transaction); `next` names the successor, or
/// [`END_OF_CHAIN`](crate::ids::END_OF_CHAIN) at the tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionNode {
    /// Transaction id.
    pub id: Uuid,
    /// Predecessor in the artifact chain; nil for a create.
    pub prev: Uuid,
    /// Successor in the artifact chain; all-ones at the tail.
    pub next: Uuid,
    /// The artifact this transaction belongs to.
    pub artifact_id: Uuid,
    /// Lifecycle state.
    pub state: TransactionState,
    /// The opaque signed certificate.
    pub cert: Vec<u8>,
}

/// An artifact's index record.
///
/// Created when the artifact's create transaction is attested and updated on
/// every subsequent promotion and canonization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Artifact id.
    pub artifact_id: Uuid,
    /// The artifact's create transaction.
    pub first_txn: Uuid,
    /// The most recent transaction in the chain.
    pub latest_txn: Uuid,
    /// Height at which the artifact first appeared in a block.
    pub first_height: Height,
    /// Height of the newest block containing one of its transactions.
    pub latest_height: Height,
    /// State of the latest transaction.
    pub latest_state: TransactionState,
}

/// A block node in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    /// Block id.
    pub block_id: Uuid,
    /// Previous block; nil for the first block.
    pub prev: Uuid,
    /// Next block; all-ones at the tip.
    pub next: Uuid,
    /// First transaction contained in the block.
    pub first_txn: Uuid,
    /// Block height. Heights are contiguous; the first produced block has
    /// height one, with height zero standing for the implicit nil root.
    pub height: Height,
    /// The signed block certificate.
    pub cert: Vec<u8>,
}

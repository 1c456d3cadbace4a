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

//! The storage engine behind the data service front-end.
//!
//! The on-disk table layout is an external concern; the front-end only needs
//! the operations below. [`MemoryStore`] is the in-crate engine: ordered maps
//! per table plus an insertion-order index over the pending queue. Failures
//! are reported as the [`StatusCode`] the front-end answers with.

use uuid::Uuid;

use std::collections::BTreeMap;

use ledgerd::{
    cert::{field, Certificate},
    ids::{Height, GLOBAL_SETTING_LATEST_BLOCK_ID},
    records::{ArtifactRecord, BlockNode, TransactionNode, TransactionState},
    StatusCode, END_OF_CHAIN,
};

#[derive(Debug, Clone)]
struct PendingEntry {
    node: TransactionNode,
    seq: u64,
}

/// In-memory storage engine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    globals: BTreeMap<u64, Vec<u8>>,
    pending: BTreeMap<Uuid, PendingEntry>,
    queue: BTreeMap<u64, Uuid>,
    next_seq: u64,
    artifacts: BTreeMap<Uuid, ArtifactRecord>,
    blocks: BTreeMap<Uuid, BlockNode>,
    heights: BTreeMap<u64, Uuid>,
    canonized: BTreeMap<Uuid, TransactionNode>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a global setting.
    pub fn global_get(&self, key: u64) -> Result<Vec<u8>, StatusCode> {
        self.globals.get(&key).cloned().ok_or(StatusCode::NotFound)
    }

    /// Writes a global setting.
    pub fn global_set(&mut self, key: u64, value: Vec<u8>) {
        self.globals.insert(key, value);
    }

    /// The latest-block pointer; nil before the first block.
    pub fn latest_block_id(&self) -> Uuid {
        self.globals
            .get(&GLOBAL_SETTING_LATEST_BLOCK_ID)
            .and_then(|raw| Uuid::from_slice(raw).ok())
            .unwrap_or_else(Uuid::nil)
    }

    /// Enqueues a submitted transaction at the queue tail.
    pub fn transaction_submit(
        &mut self,
        txn_id: Uuid,
        artifact_id: Uuid,
        cert: Vec<u8>,
    ) -> Result<(), StatusCode> {
        if self.pending.contains_key(&txn_id) || self.canonized.contains_key(&txn_id) {
            return Err(StatusCode::Conflict);
        }

        // The predecessor claim comes from the certificate; attestation
        // decides whether to believe it.
        let prev = Certificate::parse(&cert)
            .ok()
            .and_then(|parsed| parsed.get_uuid(field::PREV_TRANSACTION_ID).ok())
            .unwrap_or_else(Uuid::nil);

        let node = TransactionNode {
            id: txn_id,
            prev,
            next: END_OF_CHAIN,
            artifact_id,
            state: TransactionState::Submitted,
            cert,
        };

        // Link the predecessor's chain pointer forward to this node.
        if !prev.is_nil() {
            if let Some(entry) = self.pending.get_mut(&prev) {
                entry.node.next = txn_id;
            } else if let Some(prev_node) = self.canonized.get_mut(&prev) {
                prev_node.next = txn_id;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert(seq, txn_id);
        self.pending.insert(txn_id, PendingEntry { node, seq });
        Ok(())
    }

    /// The head of the process queue.
    pub fn transaction_get_first(&self) -> Result<TransactionNode, StatusCode> {
        let (_, head) = self.queue.iter().next().ok_or(StatusCode::NotFound)?;
        Ok(self.pending[head].node.clone())
    }

    /// A pending transaction by id.
    pub fn transaction_get(&self, txn_id: &Uuid) -> Result<TransactionNode, StatusCode> {
        self.pending
            .get(txn_id)
            .map(|entry| entry.node.clone())
            .ok_or(StatusCode::NotFound)
    }

    /// Promotes a pending transaction from submitted to attested and
    /// creates or updates its artifact record.
    pub fn transaction_promote(&mut self, txn_id: &Uuid) -> Result<(), StatusCode> {
        let entry = self.pending.get_mut(txn_id).ok_or(StatusCode::NotFound)?;
        if entry.node.state != TransactionState::Submitted {
            return Err(StatusCode::Conflict);
        }
        entry.node.state = TransactionState::Attested;

        let artifact_id = entry.node.artifact_id;
        let id = entry.node.id;
        let is_create = entry.node.prev.is_nil();

        match self.artifacts.get_mut(&artifact_id) {
            Some(record) => {
                record.latest_txn = id;
                record.latest_state = TransactionState::Attested;
            }
            None if is_create => {
                self.artifacts.insert(
                    artifact_id,
                    ArtifactRecord {
                        artifact_id,
                        first_txn: id,
                        latest_txn: id,
                        first_height: Height::zero(),
                        latest_height: Height::zero(),
                        latest_state: TransactionState::Attested,
                    },
                );
            }
            None => return Err(StatusCode::Conflict),
        }
        Ok(())
    }

    /// Removes and unlinks a pending transaction.
    pub fn transaction_drop(&mut self, txn_id: &Uuid) -> Result<(), StatusCode> {
        let entry = self.pending.remove(txn_id).ok_or(StatusCode::NotFound)?;
        self.queue.remove(&entry.seq);

        let TransactionNode { prev, next, .. } = entry.node;
        if !prev.is_nil() {
            if let Some(prev_entry) = self.pending.get_mut(&prev) {
                prev_entry.node.next = next;
            } else if let Some(prev_node) = self.canonized.get_mut(&prev) {
                prev_node.next = next;
            }
        }
        if next != END_OF_CHAIN {
            if let Some(next_entry) = self.pending.get_mut(&next) {
                next_entry.node.prev = prev;
            }
        }
        Ok(())
    }

    /// An artifact record by id.
    pub fn artifact_get(&self, artifact_id: &Uuid) -> Result<ArtifactRecord, StatusCode> {
        self.artifacts
            .get(artifact_id)
            .cloned()
            .ok_or(StatusCode::NotFound)
    }

    /// Whether an id is already taken by an artifact, transaction or block.
    pub fn id_in_use(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
            || self.canonized.contains_key(id)
            || self.artifacts.contains_key(id)
            || self.blocks.contains_key(id)
    }

    /// Persists a canonized block and applies its side effects: contained
    /// transactions move from pending to canonized, artifact records advance,
    /// the chain links and the latest-block pointer move to the new block.
    ///
    /// Idempotent over `(block_id, cert)`: a retry with identical bytes
    /// succeeds without further effect; the same id with different bytes is
    /// a conflict.
    pub fn block_make(&mut self, block_id: Uuid, cert: Vec<u8>) -> Result<(), StatusCode> {
        if let Some(existing) = self.blocks.get(&block_id) {
            return if existing.cert == cert {
                Ok(())
            } else {
                Err(StatusCode::Conflict)
            };
        }

        let parsed = Certificate::parse(&cert).map_err(|_| StatusCode::Malformed)?;
        let prev_block = parsed
            .get_uuid(field::PREV_BLOCK_ID)
            .map_err(|_| StatusCode::Malformed)?;
        let height = Height(
            parsed
                .get_u64(field::BLOCK_HEIGHT)
                .map_err(|_| StatusCode::Malformed)?,
        );

        let latest = self.latest_block_id();
        if prev_block != latest {
            return Err(StatusCode::Conflict);
        }
        let expected_height = match self.blocks.get(&latest) {
            Some(tip) => tip.height.next(),
            None => Height(1),
        };
        if height != expected_height {
            return Err(StatusCode::Conflict);
        }

        let wrapped = parsed.find_all(field::WRAPPED_TRANSACTION);
        if wrapped.is_empty() {
            return Err(StatusCode::Malformed);
        }

        let mut first_txn = None;
        for raw_txn in wrapped {
            let txn_cert = Certificate::parse(raw_txn).map_err(|_| StatusCode::Malformed)?;
            let txn_id = txn_cert
                .get_uuid(field::TRANSACTION_ID)
                .map_err(|_| StatusCode::Malformed)?;
            let artifact_id = txn_cert
                .get_uuid(field::ARTIFACT_ID)
                .map_err(|_| StatusCode::Malformed)?;
            let prev_txn = txn_cert
                .get_uuid(field::PREV_TRANSACTION_ID)
                .unwrap_or_else(|_| Uuid::nil());

            if first_txn.is_none() {
                first_txn = Some(txn_id);
            }

            if let Some(entry) = self.pending.remove(&txn_id) {
                self.queue.remove(&entry.seq);
            }

            if !prev_txn.is_nil() {
                if let Some(prev_node) = self.canonized.get_mut(&prev_txn) {
                    prev_node.next = txn_id;
                }
            }
            self.canonized.insert(
                txn_id,
                TransactionNode {
                    id: txn_id,
                    prev: prev_txn,
                    next: END_OF_CHAIN,
                    artifact_id,
                    state: TransactionState::Canonized,
                    cert: raw_txn.to_vec(),
                },
            );

            let record = self
                .artifacts
                .entry(artifact_id)
                .or_insert_with(|| ArtifactRecord {
                    artifact_id,
                    first_txn: txn_id,
                    latest_txn: txn_id,
                    first_height: height,
                    latest_height: height,
                    latest_state: TransactionState::Canonized,
                });
            record.latest_txn = txn_id;
            record.latest_height = height;
            record.latest_state = TransactionState::Canonized;
            if record.first_height == Height::zero() {
                record.first_height = height;
            }
        }

        if let Some(tip) = self.blocks.get_mut(&latest) {
            tip.next = block_id;
        }
        self.blocks.insert(
            block_id,
            BlockNode {
                block_id,
                prev: latest,
                next: END_OF_CHAIN,
                first_txn: first_txn.unwrap_or_else(Uuid::nil),
                height,
                cert,
            },
        );
        self.heights.insert(height.0, block_id);
        self.global_set(
            GLOBAL_SETTING_LATEST_BLOCK_ID,
            block_id.as_bytes().to_vec(),
        );
        Ok(())
    }

    /// A block node by id.
    pub fn block_get(&self, block_id: &Uuid) -> Result<BlockNode, StatusCode> {
        self.blocks
            .get(block_id)
            .cloned()
            .ok_or(StatusCode::NotFound)
    }

    /// Resolves a height to the block id canonized at it.
    pub fn block_id_by_height(&self, height: Height) -> Result<Uuid, StatusCode> {
        self.heights
            .get(&height.0)
            .copied()
            .ok_or(StatusCode::NotFound)
    }

    /// A canonized transaction by id.
    pub fn canonized_transaction_get(&self, txn_id: &Uuid) -> Result<TransactionNode, StatusCode> {
        self.canonized
            .get(txn_id)
            .cloned()
            .ok_or(StatusCode::NotFound)
    }
}

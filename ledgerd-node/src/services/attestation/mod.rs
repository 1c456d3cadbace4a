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

//! The attestation service.
//!
//! Wakes on a sleep tick, opens a data-service child context, and walks the
//! pending queue from its head: every submitted transaction is checked for
//! field validity, sequence and uniqueness, then promoted or dropped. Two
//! per-pass maps keyed by id carry what this pass has already promoted —
//! the transaction map and the artifact projection map — so chained
//! transactions in one pass resolve without re-querying the data service.
//!
//! A data-service failure on promote is fatal: the service exits and the
//! supervisor restarts it. An empty queue is the normal idle case. A failed
//! drop is logged and ignored, since canonization may have raced us to the
//! entry.

use log::{debug, info, warn};
use uuid::Uuid;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use ledgerd::{
    api::data::DataMethod,
    cert::{field, Certificate},
    records::{TransactionNode, TransactionState},
    CapabilitySet, StatusCode, END_OF_CHAIN,
};
use sodiumoxide::crypto::sign::ed25519;

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, sleep::spawn_sleep_thread};
use crate::services::data::client::DataClient;
use crate::services::setup::run_control_setup;

/// Artifact state as projected by the current pass.
#[derive(Debug, Clone, Copy)]
struct ArtifactProjection {
    latest_txn: Uuid,
}

/// The attestation pass state over one data-service connection.
pub struct Attestation {
    data: DataClient,
    child: u32,
    signers: HashMap<Uuid, ed25519::PublicKey>,
    transaction_tree: BTreeMap<Uuid, TransactionState>,
    artifact_tree: BTreeMap<Uuid, ArtifactProjection>,
}

impl std::fmt::Debug for Attestation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attestation")
            .field("child", &self.child)
            .field("signers", &self.signers.len())
            .finish()
    }
}

/// The capability set an attestation child context needs.
pub fn child_caps() -> CapabilitySet {
    CapabilitySet::with_indices(&[
        DataMethod::ChildContextClose.cap_index(),
        DataMethod::TransactionGetFirst.cap_index(),
        DataMethod::TransactionGet.cap_index(),
        DataMethod::TransactionPromote.cap_index(),
        DataMethod::TransactionDrop.cap_index(),
        DataMethod::ArtifactGet.cap_index(),
        DataMethod::BlockGet.cap_index(),
        DataMethod::CanonizedTransactionGet.cap_index(),
    ])
}

impl Attestation {
    /// Opens the data-service child context this service works through.
    pub async fn open(
        mut data: DataClient,
        signers: HashMap<Uuid, ed25519::PublicKey>,
    ) -> anyhow::Result<Self> {
        data.root_context_create().await?;
        let child = data.child_context_create(child_caps()).await?;
        Ok(Self {
            data,
            child,
            signers,
            transaction_tree: BTreeMap::new(),
            artifact_tree: BTreeMap::new(),
        })
    }

    /// Runs one attestation pass. Returns the number of promoted
    /// transactions.
    pub async fn run_pass(&mut self) -> anyhow::Result<usize> {
        let mut promoted = 0;

        let head = match self.data.transaction_get_first(self.child).await? {
            // Empty queue: back to sleep.
            None => return Ok(0),
            Some(node) => node,
        };
        if head.state == TransactionState::Attested {
            // The head awaits canonization; nothing for this pass.
            return Ok(0);
        }

        let mut node = Some(head);
        while let Some(current) = node.take() {
            if current.state == TransactionState::Submitted {
                if self.attest(&current).await? {
                    self.promote(&current).await?;
                    promoted += 1;
                } else {
                    self.drop_txn(&current).await?;
                }
            }

            if current.next != END_OF_CHAIN {
                node = self.data.transaction_get(self.child, current.next).await?;
            }
        }

        self.transaction_tree.clear();
        self.artifact_tree.clear();
        Ok(promoted)
    }

    async fn attest(&mut self, node: &TransactionNode) -> anyhow::Result<bool> {
        Ok(self.verify_txn_has_valid_fields(node)
            && self.verify_txn_is_in_correct_sequence(node).await?
            && self.verify_txn_is_unique(node).await?)
    }

    /// Field validity: the certificate parses, its ids match the node, and
    /// its signature verifies against a known signer.
    fn verify_txn_has_valid_fields(&self, node: &TransactionNode) -> bool {
        let cert = match Certificate::parse(&node.cert) {
            Ok(cert) => cert,
            Err(err) => {
                debug!("txn {}: unparseable certificate: {}", node.id, err);
                return false;
            }
        };

        let ids_ok = cert.get_uuid(field::TRANSACTION_ID) == Ok(node.id)
            && cert.get_uuid(field::ARTIFACT_ID) == Ok(node.artifact_id);
        if !ids_ok {
            debug!("txn {}: certificate ids do not match the node", node.id);
            return false;
        }

        let signer = match cert.signer_id() {
            Ok(signer) => signer,
            Err(err) => {
                debug!("txn {}: no signer: {}", node.id, err);
                return false;
            }
        };
        let key = match self.signers.get(&signer) {
            Some(key) => key,
            None => {
                debug!("txn {}: unknown signer {}", node.id, signer);
                return false;
            }
        };
        if let Err(err) = cert.attest(key) {
            debug!("txn {}: signature rejected: {}", node.id, err);
            return false;
        }
        true
    }

    /// Sequence: a nil predecessor must be a create for a new artifact; any
    /// other predecessor must be the artifact's latest attested or canonized
    /// transaction.
    async fn verify_txn_is_in_correct_sequence(
        &mut self,
        node: &TransactionNode,
    ) -> anyhow::Result<bool> {
        if node.prev.is_nil() {
            // A create: the artifact must not already have a history.
            if self.artifact_tree.contains_key(&node.artifact_id) {
                return Ok(false);
            }
            let existing = self.data.artifact_get(self.child, node.artifact_id).await?;
            return Ok(existing.is_none());
        }

        // Resolved from this pass's promotions first, then from storage.
        if let Some(projection) = self.artifact_tree.get(&node.artifact_id) {
            return Ok(projection.latest_txn == node.prev);
        }
        if self.transaction_tree.contains_key(&node.prev) {
            return Ok(true);
        }
        match self.data.artifact_get(self.child, node.artifact_id).await? {
            Some(record) => Ok(record.latest_txn == node.prev
                && record.latest_state != TransactionState::Submitted),
            None => Ok(false),
        }
    }

    /// Uniqueness: the transaction id (and, for creates, the artifact id)
    /// collides with no known artifact, transaction or block id.
    async fn verify_txn_is_unique(&mut self, node: &TransactionNode) -> anyhow::Result<bool> {
        if !self.id_unused(node.id).await? {
            return Ok(false);
        }
        if node.prev.is_nil() && node.id != node.artifact_id {
            // The artifact id of a create must be fresh too; the create path
            // of verify_sequence already checked the artifact table, so the
            // remaining namespaces are transactions and blocks.
            if self.transaction_tree.contains_key(&node.artifact_id) {
                return Ok(false);
            }
            let canonized = self
                .data
                .canonized_transaction_get(self.child, node.artifact_id)
                .await?;
            if canonized.is_some() {
                return Ok(false);
            }
            if self
                .data
                .block_get(self.child, node.artifact_id)
                .await?
                .is_some()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn id_unused(&mut self, id: Uuid) -> anyhow::Result<bool> {
        if self.transaction_tree.contains_key(&id) || self.artifact_tree.contains_key(&id) {
            return Ok(false);
        }
        if self
            .data
            .canonized_transaction_get(self.child, id)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        if self.data.artifact_get(self.child, id).await?.is_some() {
            return Ok(false);
        }
        if self.data.block_get(self.child, id).await?.is_some() {
            return Ok(false);
        }
        Ok(true)
    }

    async fn promote(&mut self, node: &TransactionNode) -> anyhow::Result<()> {
        let status = self.data.transaction_promote(self.child, node.id).await?;
        if status != StatusCode::Success {
            // Anything but success here is fatal; the supervisor restarts us
            // with a clean view of the queue.
            anyhow::bail!("promote of {} failed: {}", node.id, status);
        }
        self.transaction_tree
            .insert(node.id, TransactionState::Attested);
        self.artifact_tree.insert(
            node.artifact_id,
            ArtifactProjection {
                latest_txn: node.id,
            },
        );
        Ok(())
    }

    async fn drop_txn(&mut self, node: &TransactionNode) -> anyhow::Result<()> {
        let status = self.data.transaction_drop(self.child, node.id).await?;
        if status != StatusCode::Success {
            // Canonization may have clobbered the entry already.
            warn!("drop of {} answered {}", node.id, status);
        }
        Ok(())
    }
}

/// Entry point for the attestation service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let data_fd = ServiceKind::Attestation
        .fd_for(FdRole::DataOut)
        .expect("attestation layout has a data socket");
    let control_fd = ServiceKind::Attestation
        .fd_for(FdRole::Control)
        .expect("attestation layout has a control socket");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        let mut control = super::framed_from_fd(control_fd)?;
        let data = DataClient::new(super::stream_from_fd(data_fd)?);
        let state = fibers.state();

        fibers.spawn("attestation-loop", async move {
            let setup = run_control_setup(&mut control).await?;
            let tick = Duration::from_millis(setup.config.attestation_tick_milliseconds);
            let signers = setup
                .entities
                .iter()
                .map(|entity| (entity.entity_id, entity.public_key))
                .collect();

            let mut sleeper = spawn_sleep_thread()?;
            let mut attestation = Attestation::open(data, signers).await?;
            let mut state = state;
            loop {
                tokio::select! {
                    result = sleeper.sleep(tick) => result?,
                    shutdown = runtime::shutdown_requested(&mut state) => {
                        info!("attestation service stopping ({:?})", shutdown);
                        return Ok(());
                    }
                }
                let promoted = attestation.run_pass().await?;
                if promoted > 0 {
                    info!("promoted {} transactions", promoted);
                }
            }
        });
        Ok(())
    })
}

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

//! The canonization service.
//!
//! On each tick it drains attested transactions from the pending queue (up
//! to the configured cap), wraps them into a signed block certificate linked
//! to the previous block, persists the block through the data service and
//! then pushes the new latest id to the notification service.
//!
//! If the process dies between `block_make` and the notification update, the
//! restart re-reads the latest pointer from storage, sees it already
//! advanced and simply carries on; `block_make` itself is idempotent over
//! identical bytes.

use chrono::Utc;
use log::info;
use uuid::Uuid;

use std::time::Duration;

use ledgerd::{
    api::data::DataMethod,
    cert::{field, Certificate, CertificateBuilder, CERT_TYPE_TRANSACTION_BLOCK, CERT_VERSION,
           CRYPTO_SUITE},
    ids::Height,
    records::TransactionState,
    CapabilitySet, StatusCode, END_OF_CHAIN,
};

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, sleep::spawn_sleep_thread};
use crate::services::data::client::DataClient;
use crate::services::notification::client::NotificationClient;
use crate::services::random::RandomClient;
use crate::services::setup::{run_control_setup, SigningIdentity};

// Signature width of the block-signing suite; the first block embeds an
// all-zero previous-block signature.
const SIGNATURE_LEN: usize = 64;

// Correlation offset the canonization service uses on its notification
// connection; it never has more than one request in flight.
const NOTIFY_OFFSET: u64 = 1;

/// The canonization core over one data-service connection.
pub struct Canonization {
    data: DataClient,
    child: u32,
    identity: SigningIdentity,
    max_transactions: u64,
}

impl std::fmt::Debug for Canonization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonization")
            .field("child", &self.child)
            .field("max_transactions", &self.max_transactions)
            .finish()
    }
}

/// The capability set a canonization child context needs.
pub fn child_caps() -> CapabilitySet {
    CapabilitySet::with_indices(&[
        DataMethod::ChildContextClose.cap_index(),
        DataMethod::TransactionGetFirst.cap_index(),
        DataMethod::TransactionGet.cap_index(),
        DataMethod::BlockMake.cap_index(),
        DataMethod::BlockGet.cap_index(),
        DataMethod::LatestBlockIdGet.cap_index(),
    ])
}

impl Canonization {
    /// Opens the data-service child context this service works through.
    pub async fn open(
        mut data: DataClient,
        identity: SigningIdentity,
        max_transactions: u64,
    ) -> anyhow::Result<Self> {
        data.root_context_create().await?;
        let child = data.child_context_create(child_caps()).await?;
        Ok(Self {
            data,
            child,
            identity,
            max_transactions,
        })
    }

    /// Runs one canonization tick. Returns the new block id if a block was
    /// produced.
    pub async fn run_tick(
        &mut self,
        random: &mut RandomClient,
        notify: &mut NotificationClient,
    ) -> anyhow::Result<Option<Uuid>> {
        let latest = self.data.latest_block_id(self.child).await?;

        // Chain linkage for the new block.
        let (height, prev_signature) = if latest.is_nil() {
            (Height(1), vec![0_u8; SIGNATURE_LEN])
        } else {
            let tip = self
                .data
                .block_get(self.child, latest)
                .await?
                .ok_or_else(|| anyhow::anyhow!("latest block {} is unreadable", latest))?;
            let cert = Certificate::parse(&tip.cert)
                .map_err(|err| anyhow::anyhow!("latest block certificate: {}", err))?;
            let signature = cert
                .find(field::SIGNATURE)
                .ok_or_else(|| anyhow::anyhow!("latest block is unsigned"))?;
            (tip.height.next(), signature.to_vec())
        };

        let transactions = self.collect_attested().await?;
        if transactions.is_empty() {
            return Ok(None);
        }

        let block_id = random.random_uuid().await?;
        let cert = self.build_block_cert(block_id, latest, &prev_signature, height, &transactions);

        let status = self.data.block_make(self.child, block_id, cert).await?;
        if status != StatusCode::Success {
            // Storage refused the block; restart with a clean view.
            anyhow::bail!("block make failed: {}", status);
        }

        let status = notify.block_update(NOTIFY_OFFSET, block_id).await?;
        if status != StatusCode::Success {
            anyhow::bail!("block update refused: {}", status);
        }

        info!("canonized block {} at height {}", block_id, height);
        Ok(Some(block_id))
    }

    /// Walks the pending queue collecting attested transaction certificates,
    /// up to the configured cap.
    async fn collect_attested(&mut self) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut certs = Vec::new();
        let mut node = self.data.transaction_get_first(self.child).await?;
        while let Some(current) = node.take() {
            if current.state == TransactionState::Attested {
                certs.push(current.cert.clone());
                if certs.len() as u64 >= self.max_transactions {
                    break;
                }
            }
            if current.next != END_OF_CHAIN {
                node = self.data.transaction_get(self.child, current.next).await?;
            }
        }
        Ok(certs)
    }

    fn build_block_cert(
        &self,
        block_id: Uuid,
        prev_block: Uuid,
        prev_signature: &[u8],
        height: Height,
        transactions: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut builder = CertificateBuilder::new();
        builder
            .add_u32(field::CERT_VERSION, CERT_VERSION)
            .add_u64(field::VALID_FROM, Utc::now().timestamp() as u64)
            .add_u16(field::CRYPTO_SUITE, CRYPTO_SUITE)
            .add_uuid(field::CERT_TYPE, &CERT_TYPE_TRANSACTION_BLOCK)
            .add_uuid(field::BLOCK_ID, &block_id)
            .add_uuid(field::PREV_BLOCK_ID, &prev_block)
            .add_bytes(field::PREV_BLOCK_SIGNATURE, prev_signature)
            .add_u64(field::BLOCK_HEIGHT, height.0);
        for cert in transactions {
            builder.add_bytes(field::WRAPPED_TRANSACTION, cert);
        }
        builder.sign(&self.identity.entity_id, &self.identity.secret_key)
    }
}

/// Entry point for the canonization service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let data_fd = ServiceKind::Canonization
        .fd_for(FdRole::DataOut)
        .expect("canonization layout has a data socket");
    let random_fd = ServiceKind::Canonization
        .fd_for(FdRole::RandomOut)
        .expect("canonization layout has a random socket");
    let control_fd = ServiceKind::Canonization
        .fd_for(FdRole::Control)
        .expect("canonization layout has a control socket");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        let mut control = super::framed_from_fd(control_fd)?;
        let data = DataClient::new(super::stream_from_fd(data_fd)?);
        let mut random = RandomClient::new(super::stream_from_fd(random_fd)?);
        let state = fibers.state();

        fibers.spawn("canonization-loop", async move {
            let setup = run_control_setup(&mut control).await?;
            let identity = setup
                .identity
                .ok_or_else(|| anyhow::anyhow!("canonization service was not keyed"))?;
            let tick = Duration::from_millis(setup.config.block_max_milliseconds);

            // The notification socket arrives over the control channel after
            // setup, as a passed descriptor.
            let notify_stream = crate::supervisor::fdpass::recv_fd_stream(control.get_ref()).await?;
            let mut notify = NotificationClient::new(notify_stream);

            let mut canonization =
                Canonization::open(data, identity, setup.config.block_max_transactions).await?;
            let mut sleeper = spawn_sleep_thread()?;
            let mut state = state;
            loop {
                tokio::select! {
                    result = sleeper.sleep(tick) => result?,
                    shutdown = runtime::shutdown_requested(&mut state) => {
                        info!("canonization service stopping ({:?})", shutdown);
                        return Ok(());
                    }
                }
                canonization.run_tick(&mut random, &mut notify).await?;
            }
        });
        Ok(())
    })
}

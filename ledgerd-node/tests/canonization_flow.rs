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

//! End-to-end flow through the coordination triangle: a submitted
//! transaction is attested, canonized into a signed block, and the latest
//! block id propagates through the notification service. Everything runs in
//! one process over socket pairs, the way the original isolation suites
//! drive the services.

use uuid::Uuid;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::IntoRawFd;
use std::rc::Rc;

use sodiumoxide::crypto::sign::ed25519;
use tokio_util::codec::Framed;

use ledgerd::cert::{field, Certificate, CertificateBuilder, CERT_TYPE_TRANSACTION};
use ledgerd::ids::Height;
use ledgerd::records::TransactionState;
use ledgerd::{CapabilitySet, StatusCode};
use ledgerd_ipc::FrameCodec;
use ledgerd_node::runtime::{run_service, Fibers};
use ledgerd_node::services::attestation::Attestation;
use ledgerd_node::services::canonization::Canonization;
use ledgerd_node::services::data::client::DataClient;
use ledgerd_node::services::data::{request_fiber, DataService, SharedDataService};
use ledgerd_node::services::notification::client::NotificationClient;
use ledgerd_node::services::notification::{spawn_connection, NotificationState};
use ledgerd_node::services::random;
use ledgerd_node::services::setup::SigningIdentity;

const TXN_ID: [u8; 16] = [
    0xb8, 0x4e, 0x5b, 0xe9, 0x11, 0x4f, 0x4c, 0x51, 0x86, 0x0f, 0x61, 0x7d, 0x00, 0x55, 0xbc,
    0x23,
];
const ARTIFACT_ID: [u8; 16] = [
    0xf2, 0x66, 0xf1, 0x55, 0x51, 0x5c, 0x4b, 0x0f, 0x9a, 0x78, 0x2e, 0x46, 0x11, 0x77, 0x30,
    0x64,
];

fn spawn_data_client(fibers: &Fibers, service: SharedDataService) -> DataClient {
    let (svc_end, client_end) = tokio::net::UnixStream::pair().unwrap();
    fibers.spawn(
        "data-requests",
        request_fiber(
            Framed::new(svc_end, FrameCodec::default()),
            service,
            fibers.clone(),
        ),
    );
    DataClient::new(client_end)
}

fn signed_create_txn(signer: &Uuid, key: &ed25519::SecretKey) -> Vec<u8> {
    let mut builder = CertificateBuilder::new();
    builder
        .add_uuid(field::CERT_TYPE, &CERT_TYPE_TRANSACTION)
        .add_uuid(field::TRANSACTION_ID, &Uuid::from_bytes(TXN_ID))
        .add_uuid(field::PREV_TRANSACTION_ID, &Uuid::nil())
        .add_uuid(field::ARTIFACT_ID, &Uuid::from_bytes(ARTIFACT_ID));
    builder.sign(signer, key)
}

#[test]
fn empty_tick_then_single_attested_block() {
    sodiumoxide::init().ok();
    let (client_pk, client_sk) = ed25519::gen_keypair();
    let (_, canonizer_sk) = ed25519::gen_keypair();
    let client_entity = Uuid::from_bytes([0x42; 16]);
    let canonizer_entity = Uuid::from_bytes([0x43; 16]);

    run_service(move |fibers| async move {
        let service: SharedDataService = Rc::new(RefCell::new(DataService::new()));

        // The random service over the system entropy device.
        let device_fd = std::fs::File::open("/dev/urandom")?.into_raw_fd();
        let (random_svc, random_client) = tokio::net::UnixStream::pair()?;
        fibers.spawn(
            "random",
            random::client_fiber(random_svc, device_fd, fibers.clone()),
        );
        let mut random = random::RandomClient::new(random_client);

        // The notification service with the canonization connection.
        let notify_state = Rc::new(RefCell::new(NotificationState::new()));
        let (notify_svc, notify_client) = tokio::net::UnixStream::pair()?;
        spawn_connection(
            &fibers,
            notify_state.clone(),
            0,
            notify_svc,
            ("notify-read", "notify-write"),
        );
        let mut notify = NotificationClient::new(notify_client);

        // Attestation over its own data connection, trusting the client
        // entity's key.
        let mut signers = HashMap::new();
        signers.insert(client_entity, client_pk);
        let mut attestation =
            Attestation::open(spawn_data_client(&fibers, service.clone()), signers).await?;

        // Scenario: the empty-queue tick promotes nothing.
        assert_eq!(attestation.run_pass().await?, 0);

        // A client submits one valid create transaction.
        let mut submitter = spawn_data_client(&fibers, service.clone());
        submitter.root_context_create().await?;
        let submit_child = submitter.child_context_create(CapabilitySet::full()).await?;
        let status = submitter
            .transaction_submit(
                submit_child,
                Uuid::from_bytes(TXN_ID),
                Uuid::from_bytes(ARTIFACT_ID),
                signed_create_txn(&client_entity, &client_sk),
            )
            .await?;
        assert_eq!(status, StatusCode::Success);

        // The next pass promotes it.
        assert_eq!(attestation.run_pass().await?, 1);

        // Canonization drains it into a signed block and pushes the update.
        let identity = SigningIdentity {
            entity_id: canonizer_entity,
            public_key: ed25519::PublicKey::from_slice(&[0; 32]).expect("key width"),
            secret_key: canonizer_sk,
        };
        let mut canonization =
            Canonization::open(spawn_data_client(&fibers, service.clone()), identity, 10).await?;
        let block_id = canonization
            .run_tick(&mut random, &mut notify)
            .await?
            .expect("a block was due");

        // Post-conditions: the latest pointer moved and the block carries
        // the transaction at height one.
        let latest = submitter.latest_block_id(submit_child).await?;
        assert_eq!(latest, block_id);
        assert!(!latest.is_nil());
        assert_eq!(notify_state.borrow().latest_block_id(), block_id);

        let block = submitter
            .block_get(submit_child, latest)
            .await?
            .expect("latest block is readable");
        assert_eq!(block.first_txn, Uuid::from_bytes(TXN_ID));
        assert_eq!(block.height, Height(1));
        assert_eq!(block.prev, Uuid::nil());

        let cert = Certificate::parse(&block.cert).expect("block cert parses");
        assert_eq!(cert.get_u64(field::BLOCK_HEIGHT), Ok(1));
        assert_eq!(cert.get_uuid(field::BLOCK_ID), Ok(block_id));
        assert_eq!(cert.get_uuid(field::PREV_BLOCK_ID), Ok(Uuid::nil()));
        assert_eq!(cert.signer_id(), Ok(canonizer_entity));
        assert_eq!(cert.find_all(field::WRAPPED_TRANSACTION).len(), 1);

        // The pending queue drained and the transaction is canonized.
        assert!(submitter
            .transaction_get_first(submit_child)
            .await?
            .is_none());
        let canonized = submitter
            .canonized_transaction_get(submit_child, Uuid::from_bytes(TXN_ID))
            .await?
            .expect("transaction is canonized");
        assert_eq!(canonized.state, TransactionState::Canonized);

        // A quiet tick afterwards produces nothing.
        assert_eq!(canonization.run_tick(&mut random, &mut notify).await?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn invalid_transactions_are_dropped() {
    sodiumoxide::init().ok();
    let (_unknown_pk, unknown_sk) = ed25519::gen_keypair();
    let (client_pk, _client_sk) = ed25519::gen_keypair();
    let client_entity = Uuid::from_bytes([0x42; 16]);

    run_service(move |fibers| async move {
        let service: SharedDataService = Rc::new(RefCell::new(DataService::new()));

        // The signer below is not in the authorized set.
        let mut signers = HashMap::new();
        signers.insert(client_entity, client_pk);
        let mut attestation =
            Attestation::open(spawn_data_client(&fibers, service.clone()), signers).await?;

        let mut submitter = spawn_data_client(&fibers, service.clone());
        submitter.root_context_create().await?;
        let child = submitter.child_context_create(CapabilitySet::full()).await?;
        let stranger = Uuid::from_bytes([0x66; 16]);
        submitter
            .transaction_submit(
                child,
                Uuid::from_bytes(TXN_ID),
                Uuid::from_bytes(ARTIFACT_ID),
                {
                    let mut builder = CertificateBuilder::new();
                    builder
                        .add_uuid(field::TRANSACTION_ID, &Uuid::from_bytes(TXN_ID))
                        .add_uuid(field::PREV_TRANSACTION_ID, &Uuid::nil())
                        .add_uuid(field::ARTIFACT_ID, &Uuid::from_bytes(ARTIFACT_ID));
                    builder.sign(&stranger, &unknown_sk)
                },
            )
            .await?;

        // The pass drops it: nothing promoted, queue empty afterwards.
        assert_eq!(attestation.run_pass().await?, 0);
        assert!(submitter.transaction_get_first(child).await?.is_none());
        Ok(())
    })
    .unwrap();
}

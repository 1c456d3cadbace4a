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

//! The data service front-end.
//!
//! A method-coded request router in front of the storage engine. Callers
//! operate through child contexts held in an arena: each context carries a
//! capability set seeded by intersection with the root set at creation and
//! only reducible afterwards. Every request names its context; the router
//! checks the method's capability bit and answers `unauthorized` (offset
//! still echoed) when it is missing.

use futures::{SinkExt, StreamExt};
use log::{debug, info};

use ledgerd::{
    api::data::{DataMethod, DataRequest, DataRequestBody, DataResponse, DataResponseBody},
    CapabilitySet, StatusCode,
};
use ledgerd_ipc::Frame;

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, Fibers};

pub mod client;
pub mod engine;

pub use self::engine::MemoryStore;

#[derive(Debug)]
struct ChildContext {
    caps: CapabilitySet,
}

/// The data service core: engine, root context and the child-context arena.
#[derive(Debug)]
pub struct DataService {
    store: MemoryStore,
    root_caps: Option<CapabilitySet>,
    children: Vec<Option<ChildContext>>,
}

impl DataService {
    /// Creates a service over an empty store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Creates a service over an existing store.
    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            root_caps: None,
            children: Vec::new(),
        }
    }

    /// The underlying store; used by tests to inspect post-conditions.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Handles one decoded request, producing the response to send back.
    pub fn handle(&mut self, request: DataRequest) -> DataResponse {
        let method = request.method();
        let offset = request.child;
        let (status, body) = self.dispatch(request);
        if status != StatusCode::Success {
            debug!("{:?} failed: {}", method, status);
        }
        DataResponse {
            method,
            offset,
            status,
            body: if status == StatusCode::Success {
                body
            } else {
                DataResponseBody::Empty
            },
        }
    }

    fn dispatch(&mut self, request: DataRequest) -> (StatusCode, DataResponseBody) {
        let method = request.method();
        match request.body {
            DataRequestBody::RootContextCreate => {
                if self.root_caps.is_some() {
                    return (StatusCode::Conflict, DataResponseBody::Empty);
                }
                self.root_caps = Some(CapabilitySet::full());
                (StatusCode::Success, DataResponseBody::Empty)
            }
            DataRequestBody::RootContextReduceCaps { caps } => match self.root_caps.as_mut() {
                Some(root) => {
                    root.reduce(&caps);
                    (StatusCode::Success, DataResponseBody::Empty)
                }
                None => (StatusCode::BadContext, DataResponseBody::Empty),
            },
            DataRequestBody::ChildContextCreate { caps } => {
                let root = match self.root_caps.as_ref() {
                    Some(root) => root,
                    None => return (StatusCode::BadContext, DataResponseBody::Empty),
                };
                if !root.can(method.cap_index()) {
                    return (StatusCode::Unauthorized, DataResponseBody::Empty);
                }
                let mut granted = caps;
                granted.reduce(root);
                let context = ChildContext { caps: granted };

                // Reuse the first free arena slot.
                let slot = self.children.iter().position(Option::is_none);
                let child = match slot {
                    Some(index) => {
                        self.children[index] = Some(context);
                        index
                    }
                    None => {
                        self.children.push(Some(context));
                        self.children.len() - 1
                    }
                };
                (
                    StatusCode::Success,
                    DataResponseBody::Child(child as u32),
                )
            }
            DataRequestBody::ChildContextClose => {
                let child = request.child as usize;
                match self.children.get_mut(child) {
                    Some(slot) if slot.is_some() => {
                        *slot = None;
                        (
                            StatusCode::Success,
                            DataResponseBody::Child(request.child),
                        )
                    }
                    _ => (StatusCode::BadContext, DataResponseBody::Empty),
                }
            }
            body => self.dispatch_child(method, request.child, body),
        }
    }

    fn dispatch_child(
        &mut self,
        method: DataMethod,
        child: u32,
        body: DataRequestBody,
    ) -> (StatusCode, DataResponseBody) {
        let caps = match self.children.get(child as usize) {
            Some(Some(context)) => &context.caps,
            _ => return (StatusCode::BadContext, DataResponseBody::Empty),
        };
        if !caps.can(method.cap_index()) {
            return (StatusCode::Unauthorized, DataResponseBody::Empty);
        }

        let store = &mut self.store;
        match body {
            DataRequestBody::GlobalSettingGet { key } => match store.global_get(key) {
                Ok(value) => (StatusCode::Success, DataResponseBody::Value(value)),
                Err(status) => (status, DataResponseBody::Empty),
            },
            DataRequestBody::GlobalSettingSet { key, value } => {
                store.global_set(key, value);
                (StatusCode::Success, DataResponseBody::Empty)
            }
            DataRequestBody::TransactionSubmit {
                txn_id,
                artifact_id,
                cert,
            } => status_only(store.transaction_submit(txn_id, artifact_id, cert)),
            DataRequestBody::TransactionGetFirst => match store.transaction_get_first() {
                Ok(node) => (StatusCode::Success, DataResponseBody::Transaction(node)),
                Err(status) => (status, DataResponseBody::Empty),
            },
            DataRequestBody::TransactionGet { txn_id } => match store.transaction_get(&txn_id) {
                Ok(node) => (StatusCode::Success, DataResponseBody::Transaction(node)),
                Err(status) => (status, DataResponseBody::Empty),
            },
            DataRequestBody::TransactionDrop { txn_id } => {
                status_only(store.transaction_drop(&txn_id))
            }
            DataRequestBody::TransactionPromote { txn_id } => {
                status_only(store.transaction_promote(&txn_id))
            }
            DataRequestBody::ArtifactGet { artifact_id } => match store.artifact_get(&artifact_id)
            {
                Ok(record) => (StatusCode::Success, DataResponseBody::Artifact(record)),
                Err(status) => (status, DataResponseBody::Empty),
            },
            DataRequestBody::BlockMake { block_id, cert } => {
                status_only(store.block_make(block_id, cert))
            }
            DataRequestBody::BlockGet { block_id } => match store.block_get(&block_id) {
                Ok(node) => (StatusCode::Success, DataResponseBody::Block(node)),
                Err(status) => (status, DataResponseBody::Empty),
            },
            DataRequestBody::BlockIdByHeightGet { height } => {
                match store.block_id_by_height(height) {
                    Ok(id) => (StatusCode::Success, DataResponseBody::BlockId(id)),
                    Err(status) => (status, DataResponseBody::Empty),
                }
            }
            DataRequestBody::LatestBlockIdGet => (
                StatusCode::Success,
                DataResponseBody::BlockId(store.latest_block_id()),
            ),
            DataRequestBody::CanonizedTransactionGet { txn_id } => {
                match store.canonized_transaction_get(&txn_id) {
                    Ok(node) => (StatusCode::Success, DataResponseBody::Transaction(node)),
                    Err(status) => (status, DataResponseBody::Empty),
                }
            }
            // Root and context management bodies are handled in dispatch.
            _ => (StatusCode::BadMethod, DataResponseBody::Empty),
        }
    }
}

impl Default for DataService {
    fn default() -> Self {
        Self::new()
    }
}

fn status_only(result: Result<(), StatusCode>) -> (StatusCode, DataResponseBody) {
    match result {
        Ok(()) => (StatusCode::Success, DataResponseBody::Empty),
        Err(status) => (status, DataResponseBody::Empty),
    }
}

/// A data service shared between request fibers.
///
/// Production processes serve one request socket; the shared handle is what
/// lets tests (and a future multi-socket front-end) route several callers
/// onto one context arena.
pub type SharedDataService = std::rc::Rc<std::cell::RefCell<DataService>>;

/// The request-routing fiber: decodes requests from the request socket,
/// dispatches them and writes responses back in order.
pub async fn request_fiber(
    mut io: tokio_util::codec::Framed<tokio::net::UnixStream, ledgerd_ipc::FrameCodec>,
    service: SharedDataService,
    fibers: Fibers,
) -> anyhow::Result<()> {
    let mut state = fibers.state();
    loop {
        let frame = tokio::select! {
            frame = io.next() => frame,
            shutdown = runtime::shutdown_requested(&mut state) => {
                info!("data service draining ({:?})", shutdown);
                return Ok(());
            }
        };

        let frame = match frame {
            Some(frame) => frame?,
            // Peer went away; the supervisor decides whether to restart.
            None => return Ok(()),
        };

        // A malformed request is a protocol violation and fatal to this
        // fiber; inline errors travel in the response status instead.
        let request = DataRequest::decode(&frame.into_data()?)?;
        let response = service.borrow_mut().handle(request);
        io.send(Frame::Data(response.encode())).await?;
    }
}

/// Entry point for the data service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let request_fd = ServiceKind::Data
        .fd_for(FdRole::Request)
        .expect("data layout has a request socket");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        let io = super::framed_from_fd(request_fd)?;
        let service: SharedDataService =
            std::rc::Rc::new(std::cell::RefCell::new(DataService::new()));
        fibers.spawn("data-requests", request_fiber(io, service, fibers.clone()));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use ledgerd::{
        cert::{field, CertificateBuilder},
        ids::Height,
        records::TransactionState,
        END_OF_CHAIN,
    };

    use super::*;

    fn request(child: u32, body: DataRequestBody) -> DataRequest {
        DataRequest { child, body }
    }

    fn open_child(service: &mut DataService, caps: CapabilitySet) -> u32 {
        let response = service.handle(request(0, DataRequestBody::RootContextCreate));
        assert!(matches!(
            response.status,
            StatusCode::Success | StatusCode::Conflict
        ));
        let response = service.handle(request(0, DataRequestBody::ChildContextCreate { caps }));
        assert_eq!(response.status, StatusCode::Success);
        match response.body {
            DataResponseBody::Child(child) => child,
            other => panic!("unexpected body: {:?}", other),
        }
    }

    fn signed_txn(txn_id: Uuid, artifact_id: Uuid, prev: Uuid) -> Vec<u8> {
        sodiumoxide::init().ok();
        let (_, sk) = sodiumoxide::crypto::sign::ed25519::gen_keypair();
        let mut builder = CertificateBuilder::new();
        builder
            .add_uuid(field::TRANSACTION_ID, &txn_id)
            .add_uuid(field::PREV_TRANSACTION_ID, &prev)
            .add_uuid(field::ARTIFACT_ID, &artifact_id);
        builder.sign(&Uuid::from_bytes([0x77; 16]), &sk)
    }

    #[test]
    fn empty_queue_returns_not_found() {
        let mut service = DataService::new();
        let child = open_child(&mut service, CapabilitySet::full());
        let response = service.handle(request(child, DataRequestBody::TransactionGetFirst));
        assert_eq!(response.status, StatusCode::NotFound);
        assert_eq!(response.body, DataResponseBody::Empty);
        assert_eq!(response.offset, child);
    }

    #[test]
    fn submit_then_get_first() {
        let mut service = DataService::new();
        let child = open_child(&mut service, CapabilitySet::full());
        let txn_id = Uuid::from_bytes([0xb8; 16]);
        let artifact_id = Uuid::from_bytes([0xf2; 16]);
        let cert = signed_txn(txn_id, artifact_id, Uuid::nil());

        let response = service.handle(request(
            child,
            DataRequestBody::TransactionSubmit {
                txn_id,
                artifact_id,
                cert,
            },
        ));
        assert_eq!(response.status, StatusCode::Success);

        let response = service.handle(request(child, DataRequestBody::TransactionGetFirst));
        assert_eq!(response.status, StatusCode::Success);
        match response.body {
            DataResponseBody::Transaction(node) => {
                assert_eq!(node.id, txn_id);
                assert_eq!(node.prev, Uuid::nil());
                assert_eq!(node.next, END_OF_CHAIN);
                assert_eq!(node.state, TransactionState::Submitted);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn unauthorized_method_echoes_offset() {
        let mut service = DataService::new();
        let child = open_child(
            &mut service,
            CapabilitySet::with_indices(&[DataMethod::TransactionGetFirst.cap_index()]),
        );
        let response = service.handle(request(
            child,
            DataRequestBody::TransactionPromote {
                txn_id: Uuid::from_bytes([1; 16]),
            },
        ));
        assert_eq!(response.status, StatusCode::Unauthorized);
        assert_eq!(response.offset, child);
        assert_eq!(response.method, DataMethod::TransactionPromote);
    }

    #[test]
    fn child_caps_cannot_exceed_root() {
        let mut service = DataService::new();
        service.handle(request(0, DataRequestBody::RootContextCreate));
        let mut narrowed = CapabilitySet::full();
        narrowed.reduce(&CapabilitySet::with_indices(&[
            DataMethod::ChildContextCreate.cap_index(),
            DataMethod::TransactionGetFirst.cap_index(),
        ]));
        service.handle(request(
            0,
            DataRequestBody::RootContextReduceCaps { caps: narrowed },
        ));

        let response = service.handle(request(
            0,
            DataRequestBody::ChildContextCreate {
                caps: CapabilitySet::full(),
            },
        ));
        let child = match response.body {
            DataResponseBody::Child(child) => child,
            other => panic!("unexpected body: {:?}", other),
        };

        // Granted set is the intersection: promote is outside it.
        let response = service.handle(request(
            child,
            DataRequestBody::TransactionPromote {
                txn_id: Uuid::from_bytes([1; 16]),
            },
        ));
        assert_eq!(response.status, StatusCode::Unauthorized);
        let response = service.handle(request(child, DataRequestBody::TransactionGetFirst));
        assert_eq!(response.status, StatusCode::NotFound);
    }

    #[test]
    fn closed_context_is_rejected() {
        let mut service = DataService::new();
        let child = open_child(&mut service, CapabilitySet::full());
        let response = service.handle(request(child, DataRequestBody::ChildContextClose));
        assert_eq!(response.status, StatusCode::Success);
        let response = service.handle(request(child, DataRequestBody::TransactionGetFirst));
        assert_eq!(response.status, StatusCode::BadContext);
    }

    #[test]
    fn promote_creates_artifact_record() {
        let mut service = DataService::new();
        let child = open_child(&mut service, CapabilitySet::full());
        let txn_id = Uuid::from_bytes([0xb8; 16]);
        let artifact_id = Uuid::from_bytes([0xf2; 16]);
        service.handle(request(
            child,
            DataRequestBody::TransactionSubmit {
                txn_id,
                artifact_id,
                cert: signed_txn(txn_id, artifact_id, Uuid::nil()),
            },
        ));

        let response =
            service.handle(request(child, DataRequestBody::TransactionPromote { txn_id }));
        assert_eq!(response.status, StatusCode::Success);

        let response = service.handle(request(child, DataRequestBody::ArtifactGet { artifact_id }));
        match response.body {
            DataResponseBody::Artifact(record) => {
                assert_eq!(record.first_txn, txn_id);
                assert_eq!(record.latest_txn, txn_id);
                assert_eq!(record.latest_state, TransactionState::Attested);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn block_make_is_idempotent_and_conflicts_on_different_bytes() {
        let mut service = DataService::new();
        let child = open_child(&mut service, CapabilitySet::full());
        let txn_id = Uuid::from_bytes([0xb8; 16]);
        let artifact_id = Uuid::from_bytes([0xf2; 16]);
        let txn_cert = signed_txn(txn_id, artifact_id, Uuid::nil());
        service.handle(request(
            child,
            DataRequestBody::TransactionSubmit {
                txn_id,
                artifact_id,
                cert: txn_cert.clone(),
            },
        ));
        service.handle(request(child, DataRequestBody::TransactionPromote { txn_id }));

        sodiumoxide::init().ok();
        let (_, sk) = sodiumoxide::crypto::sign::ed25519::gen_keypair();
        let block_id = Uuid::from_bytes([0xa4; 16]);
        let mut builder = CertificateBuilder::new();
        builder
            .add_uuid(field::BLOCK_ID, &block_id)
            .add_uuid(field::PREV_BLOCK_ID, &Uuid::nil())
            .add_u64(field::BLOCK_HEIGHT, 1)
            .add_bytes(field::WRAPPED_TRANSACTION, &txn_cert);
        let block_cert = builder.sign(&Uuid::from_bytes([0x77; 16]), &sk);

        let make = |cert: Vec<u8>| {
            DataRequestBody::BlockMake {
                block_id,
                cert,
            }
        };
        let response = service.handle(request(child, make(block_cert.clone())));
        assert_eq!(response.status, StatusCode::Success);
        // Identical retry succeeds and changes nothing.
        let response = service.handle(request(child, make(block_cert.clone())));
        assert_eq!(response.status, StatusCode::Success);
        // Same id, different bytes: rejected.
        let mut tampered = block_cert.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let response = service.handle(request(child, make(tampered)));
        assert_eq!(response.status, StatusCode::Conflict);

        // Post-conditions of the single attested block scenario.
        let response = service.handle(request(child, DataRequestBody::LatestBlockIdGet));
        assert_eq!(response.body, DataResponseBody::BlockId(block_id));
        let response = service.handle(request(child, DataRequestBody::BlockGet { block_id }));
        match response.body {
            DataResponseBody::Block(node) => {
                assert_eq!(node.first_txn, txn_id);
                assert_eq!(node.height, Height(1));
                assert_eq!(node.prev, Uuid::nil());
                assert_eq!(node.next, END_OF_CHAIN);
            }
            other => panic!("unexpected body: {:?}", other),
        }
        // The transaction left the pending queue and is canonized.
        let response = service.handle(request(child, DataRequestBody::TransactionGetFirst));
        assert_eq!(response.status, StatusCode::NotFound);
        let response = service.handle(request(
            child,
            DataRequestBody::CanonizedTransactionGet { txn_id },
        ));
        match response.body {
            DataResponseBody::Transaction(node) => {
                assert_eq!(node.state, TransactionState::Canonized);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn artifact_chain_links_on_submit() {
        let mut service = DataService::new();
        let child = open_child(&mut service, CapabilitySet::full());
        let first = Uuid::from_bytes([0x01; 16]);
        let second = Uuid::from_bytes([0x02; 16]);
        let artifact_id = Uuid::from_bytes([0xf2; 16]);

        service.handle(request(
            child,
            DataRequestBody::TransactionSubmit {
                txn_id: first,
                artifact_id,
                cert: signed_txn(first, artifact_id, Uuid::nil()),
            },
        ));
        service.handle(request(
            child,
            DataRequestBody::TransactionSubmit {
                txn_id: second,
                artifact_id,
                cert: signed_txn(second, artifact_id, first),
            },
        ));

        let response = service.handle(request(child, DataRequestBody::TransactionGet { txn_id: first }));
        match response.body {
            DataResponseBody::Transaction(node) => assert_eq!(node.next, second),
            other => panic!("unexpected body: {:?}", other),
        }
        let response =
            service.handle(request(child, DataRequestBody::TransactionGet { txn_id: second }));
        match response.body {
            DataResponseBody::Transaction(node) => {
                assert_eq!(node.prev, first);
                assert_eq!(node.next, END_OF_CHAIN);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}

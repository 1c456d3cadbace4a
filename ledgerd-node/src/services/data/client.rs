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

//! Async client for the data service.
//!
//! One request is in flight per client at a time; the data service answers
//! in order, and the response's echoed method is checked against the request
//! before the payload is believed.

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use uuid::Uuid;

use ledgerd::{
    api::{
        data::{DataRequest, DataRequestBody, DataResponse, DataResponseBody},
        ApiError,
    },
    records::{ArtifactRecord, BlockNode, TransactionNode},
    CapabilitySet, StatusCode,
};
use ledgerd_ipc::{Frame, FrameCodec, FrameError};

/// A data-service connection.
#[derive(Debug)]
pub struct DataClient {
    io: Framed<tokio::net::UnixStream, FrameCodec>,
}

impl DataClient {
    /// Wraps a connected request socket.
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            io: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Sends a raw request and awaits its response. The building block for
    /// the typed calls below, and for front-ends that proxy whole packets.
    pub async fn call(&mut self, request: DataRequest) -> anyhow::Result<DataResponse> {
        let method = request.method();
        self.io.send(Frame::Data(request.encode())).await?;
        let frame = self
            .io
            .next()
            .await
            .ok_or(FrameError::PeerClosed)??;
        let response = DataResponse::decode(&frame.into_data()?)?;
        if response.method != method {
            return Err(ApiError::MethodMismatch {
                expected: method as u32,
                actual: response.method as u32,
            }
            .into());
        }
        Ok(response)
    }

    /// Creates the root context.
    pub async fn root_context_create(&mut self) -> anyhow::Result<StatusCode> {
        let response = self
            .call(DataRequest {
                child: 0,
                body: DataRequestBody::RootContextCreate,
            })
            .await?;
        Ok(response.status)
    }

    /// Opens a child context with the requested capability set.
    pub async fn child_context_create(
        &mut self,
        caps: CapabilitySet,
    ) -> anyhow::Result<u32> {
        let response = self
            .call(DataRequest {
                child: 0,
                body: DataRequestBody::ChildContextCreate { caps },
            })
            .await?;
        match (response.status, response.body) {
            (StatusCode::Success, DataResponseBody::Child(child)) => Ok(child),
            (status, _) => Err(anyhow!("child context create failed: {}", status)),
        }
    }

    /// Closes a child context.
    pub async fn child_context_close(&mut self, child: u32) -> anyhow::Result<StatusCode> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::ChildContextClose,
            })
            .await?;
        Ok(response.status)
    }

    /// Reads the head of the process queue; `Ok(None)` when the queue is
    /// empty.
    pub async fn transaction_get_first(
        &mut self,
        child: u32,
    ) -> anyhow::Result<Option<TransactionNode>> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::TransactionGetFirst,
            })
            .await?;
        expect_optional_transaction(response)
    }

    /// Reads a pending transaction; `Ok(None)` when it is absent.
    pub async fn transaction_get(
        &mut self,
        child: u32,
        txn_id: Uuid,
    ) -> anyhow::Result<Option<TransactionNode>> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::TransactionGet { txn_id },
            })
            .await?;
        expect_optional_transaction(response)
    }

    /// Submits a transaction into the pending queue.
    pub async fn transaction_submit(
        &mut self,
        child: u32,
        txn_id: Uuid,
        artifact_id: Uuid,
        cert: Vec<u8>,
    ) -> anyhow::Result<StatusCode> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::TransactionSubmit {
                    txn_id,
                    artifact_id,
                    cert,
                },
            })
            .await?;
        Ok(response.status)
    }

    /// Promotes a pending transaction to attested.
    pub async fn transaction_promote(
        &mut self,
        child: u32,
        txn_id: Uuid,
    ) -> anyhow::Result<StatusCode> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::TransactionPromote { txn_id },
            })
            .await?;
        Ok(response.status)
    }

    /// Drops a pending transaction.
    pub async fn transaction_drop(
        &mut self,
        child: u32,
        txn_id: Uuid,
    ) -> anyhow::Result<StatusCode> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::TransactionDrop { txn_id },
            })
            .await?;
        Ok(response.status)
    }

    /// Reads an artifact record; `Ok(None)` when it is absent.
    pub async fn artifact_get(
        &mut self,
        child: u32,
        artifact_id: Uuid,
    ) -> anyhow::Result<Option<ArtifactRecord>> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::ArtifactGet { artifact_id },
            })
            .await?;
        match (response.status, response.body) {
            (StatusCode::Success, DataResponseBody::Artifact(record)) => Ok(Some(record)),
            (StatusCode::NotFound, _) => Ok(None),
            (status, _) => Err(anyhow!("artifact get failed: {}", status)),
        }
    }

    /// Persists a canonized block.
    pub async fn block_make(
        &mut self,
        child: u32,
        block_id: Uuid,
        cert: Vec<u8>,
    ) -> anyhow::Result<StatusCode> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::BlockMake { block_id, cert },
            })
            .await?;
        Ok(response.status)
    }

    /// Reads a block; `Ok(None)` when it is absent.
    pub async fn block_get(
        &mut self,
        child: u32,
        block_id: Uuid,
    ) -> anyhow::Result<Option<BlockNode>> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::BlockGet { block_id },
            })
            .await?;
        match (response.status, response.body) {
            (StatusCode::Success, DataResponseBody::Block(node)) => Ok(Some(node)),
            (StatusCode::NotFound, _) => Ok(None),
            (status, _) => Err(anyhow!("block get failed: {}", status)),
        }
    }

    /// Reads the latest-block pointer.
    pub async fn latest_block_id(&mut self, child: u32) -> anyhow::Result<Uuid> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::LatestBlockIdGet,
            })
            .await?;
        match (response.status, response.body) {
            (StatusCode::Success, DataResponseBody::BlockId(id)) => Ok(id),
            (status, _) => Err(anyhow!("latest block id get failed: {}", status)),
        }
    }

    /// Reads a canonized transaction; `Ok(None)` when it is absent.
    pub async fn canonized_transaction_get(
        &mut self,
        child: u32,
        txn_id: Uuid,
    ) -> anyhow::Result<Option<TransactionNode>> {
        let response = self
            .call(DataRequest {
                child,
                body: DataRequestBody::CanonizedTransactionGet { txn_id },
            })
            .await?;
        expect_optional_transaction(response)
    }
}

fn expect_optional_transaction(
    response: DataResponse,
) -> anyhow::Result<Option<TransactionNode>> {
    match (response.status, response.body) {
        (StatusCode::Success, DataResponseBody::Transaction(node)) => Ok(Some(node)),
        (StatusCode::NotFound, _) => Ok(None),
        (status, _) => Err(anyhow!("transaction read failed: {}", status)),
    }
}

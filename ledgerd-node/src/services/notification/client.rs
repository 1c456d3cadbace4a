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

//! Async client for the notification service.
//!
//! Requests and responses are deliberately decoupled: an assertion's
//! invalidation may arrive long after the request, and other responses can
//! interleave, so senders and the response reader are separate calls.

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use uuid::Uuid;

use ledgerd::{
    api::notification::{NotifyMethod, NotifyRequest, NotifyRequestBody, NotifyResponse},
    CapabilitySet, StatusCode,
};
use ledgerd_ipc::{Frame, FrameCodec, FrameError};

/// A notification-service connection.
#[derive(Debug)]
pub struct NotificationClient {
    io: Framed<tokio::net::UnixStream, FrameCodec>,
}

impl NotificationClient {
    /// Wraps a connected client socket.
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            io: Framed::new(stream, FrameCodec::default()),
        }
    }

    /// Sends a capability reduction request.
    pub async fn send_reduce_caps(
        &mut self,
        offset: u64,
        caps: CapabilitySet,
    ) -> anyhow::Result<()> {
        self.send(NotifyRequest {
            offset,
            body: NotifyRequestBody::ReduceCaps { caps },
        })
        .await
    }

    /// Sends a block update request.
    pub async fn send_block_update(&mut self, offset: u64, block_id: Uuid) -> anyhow::Result<()> {
        self.send(NotifyRequest {
            offset,
            body: NotifyRequestBody::BlockUpdate { block_id },
        })
        .await
    }

    /// Sends a block assertion; the response arrives when the assertion is
    /// invalidated or cancelled.
    pub async fn send_block_assertion(
        &mut self,
        offset: u64,
        block_id: Uuid,
    ) -> anyhow::Result<()> {
        self.send(NotifyRequest {
            offset,
            body: NotifyRequestBody::BlockAssertion { block_id },
        })
        .await
    }

    /// Sends an assertion cancellation for `offset`.
    pub async fn send_assertion_cancel(&mut self, offset: u64) -> anyhow::Result<()> {
        self.send(NotifyRequest {
            offset,
            body: NotifyRequestBody::BlockAssertionCancel,
        })
        .await
    }

    /// Receives the next response on this connection.
    pub async fn recv_response(&mut self) -> anyhow::Result<NotifyResponse> {
        let frame = self
            .io
            .next()
            .await
            .ok_or(FrameError::PeerClosed)??;
        Ok(NotifyResponse::decode(&frame.into_data()?)?)
    }

    /// Convenience for connections that never register assertions: sends a
    /// block update and waits for its acknowledgement.
    pub async fn block_update(&mut self, offset: u64, block_id: Uuid) -> anyhow::Result<StatusCode> {
        self.send_block_update(offset, block_id).await?;
        let response = self.recv_response().await?;
        if response.method != NotifyMethod::BlockUpdate || response.offset != offset {
            return Err(anyhow!("unexpected response to block update"));
        }
        Ok(response.status)
    }

    async fn send(&mut self, request: NotifyRequest) -> anyhow::Result<()> {
        self.io.send(Frame::Data(request.encode())).await?;
        Ok(())
    }
}

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

//! Socket-level isolation tests for the notification service: the service's
//! connection fibers run against in-process socket pairs and are driven
//! through the client API, end to end through the frame codec.

use uuid::Uuid;

use std::cell::RefCell;
use std::rc::Rc;

use ledgerd::api::notification::NotifyMethod;
use ledgerd::{CapabilitySet, StatusCode};
use ledgerd_node::runtime::run_service;
use ledgerd_node::services::notification::client::NotificationClient;
use ledgerd_node::services::notification::{spawn_connection, NotificationState};

const LATEST: [u8; 16] = [
    0xa4, 0xcf, 0x44, 0x00, 0x80, 0x0f, 0x48, 0x27, 0xba, 0xc3, 0x54, 0x2c, 0xfc, 0x56, 0xdf,
    0x9d,
];
const NEXT: [u8; 16] = [
    0xdd, 0x4c, 0x97, 0x97, 0xcb, 0x8d, 0x4e, 0xaa, 0xaa, 0x1f, 0x4e, 0xf9, 0x8c, 0x1e, 0x3a,
    0xac,
];

fn harness<F, Fut>(body: F)
where
    F: FnOnce(NotificationClient, NotificationClient) -> Fut + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    run_service(move |fibers| async move {
        let state = Rc::new(RefCell::new(NotificationState::new()));
        let (canon_svc, canon_peer) = tokio::net::UnixStream::pair()?;
        let (proto_svc, proto_peer) = tokio::net::UnixStream::pair()?;
        spawn_connection(
            &fibers,
            state.clone(),
            0,
            canon_svc,
            ("canonization-read", "canonization-write"),
        );
        spawn_connection(
            &fibers,
            state,
            1,
            proto_svc,
            ("protocol-read", "protocol-write"),
        );

        body(
            NotificationClient::new(canon_peer),
            NotificationClient::new(proto_peer),
        )
        .await
    })
    .unwrap();
}

#[test]
fn assertion_before_first_update_is_invalidated_against_nil() {
    harness(|_canon, mut proto| async move {
        proto
            .send_block_assertion(7177, Uuid::from_bytes(NEXT))
            .await?;
        let response = proto.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::BlockAssertion);
        assert_eq!(response.status, StatusCode::Success);
        assert_eq!(response.offset, 7177);
        assert!(response.payload.is_empty());
        Ok(())
    });
}

#[test]
fn assertion_survives_until_a_different_update() {
    harness(|mut canon, mut proto| async move {
        let status = canon.block_update(17, Uuid::from_bytes(LATEST)).await?;
        assert_eq!(status, StatusCode::Success);

        // Matching assertion: no response yet.
        proto
            .send_block_assertion(7177, Uuid::from_bytes(LATEST))
            .await?;

        // A later update with a different id invalidates it.
        let status = canon.block_update(18, Uuid::from_bytes(NEXT)).await?;
        assert_eq!(status, StatusCode::Success);

        let response = proto.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::BlockAssertion);
        assert_eq!(response.status, StatusCode::Success);
        assert_eq!(response.offset, 7177);

        // And the invalidation arrives before any later response: a cancel
        // sent now answers strictly after it.
        proto.send_assertion_cancel(9).await?;
        let response = proto.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::BlockAssertionCancel);
        assert_eq!(response.offset, 9);
        Ok(())
    });
}

#[test]
fn invalidation_orders_before_update_ack_on_one_connection() {
    harness(|mut canon, _proto| async move {
        let status = canon.block_update(17, Uuid::from_bytes(LATEST)).await?;
        assert_eq!(status, StatusCode::Success);

        // Assertion and update ride the same connection.
        canon
            .send_block_assertion(7177, Uuid::from_bytes(LATEST))
            .await?;
        canon.send_block_update(17, Uuid::from_bytes(NEXT)).await?;

        let first = canon.recv_response().await?;
        assert_eq!(first.method, NotifyMethod::BlockAssertion);
        assert_eq!(first.offset, 7177);

        let second = canon.recv_response().await?;
        assert_eq!(second.method, NotifyMethod::BlockUpdate);
        assert_eq!(second.offset, 17);
        Ok(())
    });
}

#[test]
fn cancel_answers_even_with_nothing_outstanding() {
    harness(|_canon, mut proto| async move {
        proto.send_assertion_cancel(7177).await?;
        let response = proto.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::BlockAssertionCancel);
        assert_eq!(response.status, StatusCode::Success);
        assert_eq!(response.offset, 7177);
        assert!(response.payload.is_empty());
        Ok(())
    });
}

#[test]
fn reduce_caps_locks_the_connection_down() {
    harness(|mut canon, _proto| async move {
        canon
            .send_reduce_caps(7177, CapabilitySet::empty())
            .await?;
        let response = canon.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::ReduceCaps);
        assert_eq!(response.status, StatusCode::Success);
        assert_eq!(response.offset, 7177);

        canon
            .send_block_update(7177, Uuid::from_bytes(NEXT))
            .await?;
        let response = canon.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::BlockUpdate);
        assert_eq!(response.status, StatusCode::Unauthorized);
        assert_eq!(response.offset, 7177);

        // The second reduce is refused as well.
        canon
            .send_reduce_caps(7177, CapabilitySet::full())
            .await?;
        let response = canon.recv_response().await?;
        assert_eq!(response.method, NotifyMethod::ReduceCaps);
        assert_eq!(response.status, StatusCode::Unauthorized);
        Ok(())
    });
}

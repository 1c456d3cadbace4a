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

//! Notification service state.
//!
//! One latest-block id, and per connection: a capability set and the
//! outstanding assertions keyed by the client's offset. All mutation happens
//! on the service's main fiber; responses are pushed onto per-connection
//! outbound queues, which is what gives each client its delivery order — an
//! assertion's invalidation is enqueued before any response to a request the
//! client sent later.
//!
//! The governing invariant: an assertion stays outstanding iff its asserted
//! id equals the latest-block id at every moment since registration. Any
//! update that changes the latest id invalidates every differing assertion
//! in the same step.

use futures::channel::mpsc;
use log::debug;
use uuid::Uuid;

use std::collections::BTreeMap;

use ledgerd::{
    api::notification::{NotifyMethod, NotifyRequest, NotifyRequestBody, NotifyResponse},
    ids::short_id,
    CapabilitySet, StatusCode,
};

/// Identifies one client connection of the service.
pub type ConnId = usize;

#[derive(Debug)]
struct Connection {
    caps: CapabilitySet,
    assertions: BTreeMap<u64, Uuid>,
    outbound: mpsc::UnboundedSender<NotifyResponse>,
}

/// The notification service core.
#[derive(Debug)]
pub struct NotificationState {
    latest_block_id: Uuid,
    connections: BTreeMap<ConnId, Connection>,
}

impl NotificationState {
    /// Creates the state with the latest block id at nil.
    pub fn new() -> Self {
        Self {
            latest_block_id: Uuid::nil(),
            connections: BTreeMap::new(),
        }
    }

    /// The current latest block id.
    pub fn latest_block_id(&self) -> Uuid {
        self.latest_block_id
    }

    /// Registers a connection with a full capability set; its responses flow
    /// through `outbound`.
    pub fn register(&mut self, conn: ConnId, outbound: mpsc::UnboundedSender<NotifyResponse>) {
        self.connections.insert(
            conn,
            Connection {
                caps: CapabilitySet::full(),
                assertions: BTreeMap::new(),
                outbound,
            },
        );
    }

    /// Drops a connection and its outstanding assertions.
    pub fn unregister(&mut self, conn: ConnId) {
        self.connections.remove(&conn);
    }

    /// Outstanding assertion count for a connection. Test hook.
    pub fn assertion_count(&self, conn: ConnId) -> usize {
        self.connections
            .get(&conn)
            .map_or(0, |connection| connection.assertions.len())
    }

    /// Handles one request from `conn`, enqueueing whatever responses it
    /// produces.
    pub fn handle(&mut self, conn: ConnId, request: NotifyRequest) {
        let method = request.method();
        let offset = request.offset;

        let authorized = self
            .connections
            .get(&conn)
            .map_or(false, |connection| connection.caps.can(method.cap_index()));
        if !authorized {
            self.push(
                conn,
                NotifyResponse {
                    method,
                    status: StatusCode::Unauthorized,
                    offset,
                    payload: Vec::new(),
                },
            );
            return;
        }

        match request.body {
            NotifyRequestBody::ReduceCaps { caps } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.caps.reduce(&caps);
                }
                self.push_success(conn, method, offset);
            }
            NotifyRequestBody::BlockUpdate { block_id } => {
                debug!("latest block -> {}", short_id(&block_id));
                self.latest_block_id = block_id;

                // Invalidate every assertion that no longer matches, before
                // the updater sees its own acknowledgement.
                let conns: Vec<ConnId> = self.connections.keys().copied().collect();
                for other in conns {
                    let stale: Vec<u64> = self.connections[&other]
                        .assertions
                        .iter()
                        .filter(|(_, asserted)| **asserted != block_id)
                        .map(|(offset, _)| *offset)
                        .collect();
                    for stale_offset in stale {
                        if let Some(connection) = self.connections.get_mut(&other) {
                            connection.assertions.remove(&stale_offset);
                        }
                        self.push_success(other, NotifyMethod::BlockAssertion, stale_offset);
                    }
                }

                self.push_success(conn, method, offset);
            }
            NotifyRequestBody::BlockAssertion { block_id } => {
                if block_id != self.latest_block_id {
                    // Stale on arrival: the invalidation is immediate.
                    self.push_success(conn, method, offset);
                } else if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.assertions.insert(offset, block_id);
                }
            }
            NotifyRequestBody::BlockAssertionCancel => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.assertions.remove(&offset);
                }
                self.push_success(conn, method, offset);
            }
        }
    }

    fn push_success(&mut self, conn: ConnId, method: NotifyMethod, offset: u64) {
        self.push(
            conn,
            NotifyResponse {
                method,
                status: StatusCode::Success,
                offset,
                payload: Vec::new(),
            },
        );
    }

    fn push(&mut self, conn: ConnId, response: NotifyResponse) {
        if let Some(connection) = self.connections.get(&conn) {
            // A closed outbound queue means the writer fiber is gone; the
            // reader fiber will notice the socket shortly.
            connection.outbound.unbounded_send(response).ok();
        }
    }
}

impl Default for NotificationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;

    const CANONIZATION: ConnId = 0;
    const PROTOCOL: ConnId = 1;

    fn latest_id() -> Uuid {
        Uuid::from_slice(&[
            0xa4, 0xcf, 0x44, 0x00, 0x80, 0x0f, 0x48, 0x27, 0xba, 0xc3, 0x54, 0x2c, 0xfc, 0x56,
            0xdf, 0x9d,
        ])
        .unwrap()
    }

    fn next_id() -> Uuid {
        Uuid::from_slice(&[
            0xdd, 0x4c, 0x97, 0x97, 0xcb, 0x8d, 0x4e, 0xaa, 0xaa, 0x1f, 0x4e, 0xf9, 0x8c, 0x1e,
            0x3a, 0xac,
        ])
        .unwrap()
    }

    struct Fixture {
        state: NotificationState,
        outbound: Vec<mpsc::UnboundedReceiver<NotifyResponse>>,
    }

    fn fixture() -> Fixture {
        let mut state = NotificationState::new();
        let mut outbound = Vec::new();
        for conn in &[CANONIZATION, PROTOCOL] {
            let (tx, rx) = mpsc::unbounded();
            state.register(*conn, tx);
            outbound.push(rx);
        }
        Fixture { state, outbound }
    }

    impl Fixture {
        fn drain(&mut self, conn: ConnId) -> Vec<NotifyResponse> {
            let mut responses = Vec::new();
            while let Ok(Some(response)) = self.outbound[conn].try_next() {
                responses.push(response);
            }
            responses
        }

        fn request(&mut self, conn: ConnId, offset: u64, body: NotifyRequestBody) {
            self.state.handle(conn, NotifyRequest { offset, body });
        }
    }

    #[test]
    fn assertion_before_first_update_matches_nil() {
        let mut fx = fixture();
        // Latest is still the nil id, so asserting any real id invalidates
        // immediately.
        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::BlockAssertion {
                block_id: next_id(),
            },
        );
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].method, NotifyMethod::BlockAssertion);
        assert_eq!(responses[0].status, StatusCode::Success);
        assert_eq!(responses[0].offset, 7177);
        assert!(responses[0].payload.is_empty());
    }

    #[test]
    fn assertion_against_non_latest_invalidates_immediately() {
        let mut fx = fixture();
        fx.request(
            CANONIZATION,
            17,
            NotifyRequestBody::BlockUpdate {
                block_id: latest_id(),
            },
        );
        fx.drain(CANONIZATION);

        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::BlockAssertion {
                block_id: next_id(),
            },
        );
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].offset, 7177);
        // No state change: nothing outstanding.
        assert_eq!(fx.state.assertion_count(PROTOCOL), 0);
        assert_eq!(fx.state.latest_block_id(), latest_id());
    }

    #[test]
    fn matching_assertion_is_retained_until_update() {
        let mut fx = fixture();
        fx.request(
            CANONIZATION,
            17,
            NotifyRequestBody::BlockUpdate {
                block_id: latest_id(),
            },
        );
        fx.drain(CANONIZATION);

        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::BlockAssertion {
                block_id: latest_id(),
            },
        );
        assert!(fx.drain(PROTOCOL).is_empty());
        assert_eq!(fx.state.assertion_count(PROTOCOL), 1);

        fx.request(
            CANONIZATION,
            18,
            NotifyRequestBody::BlockUpdate {
                block_id: next_id(),
            },
        );
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].method, NotifyMethod::BlockAssertion);
        assert_eq!(responses[0].offset, 7177);
        assert_eq!(fx.state.assertion_count(PROTOCOL), 0);
    }

    #[test]
    fn invalidation_precedes_update_response_on_same_connection() {
        let mut fx = fixture();
        fx.request(
            CANONIZATION,
            17,
            NotifyRequestBody::BlockUpdate {
                block_id: latest_id(),
            },
        );
        fx.drain(CANONIZATION);

        // Assertion and the subsequent update arrive on one connection; the
        // invalidation must be delivered first.
        fx.request(
            CANONIZATION,
            7177,
            NotifyRequestBody::BlockAssertion {
                block_id: latest_id(),
            },
        );
        fx.request(
            CANONIZATION,
            17,
            NotifyRequestBody::BlockUpdate {
                block_id: next_id(),
            },
        );
        let responses = fx.drain(CANONIZATION);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].method, NotifyMethod::BlockAssertion);
        assert_eq!(responses[0].offset, 7177);
        assert_eq!(responses[1].method, NotifyMethod::BlockUpdate);
        assert_eq!(responses[1].offset, 17);
    }

    #[test]
    fn cancel_removes_assertion_and_responds() {
        let mut fx = fixture();
        fx.request(
            CANONIZATION,
            17,
            NotifyRequestBody::BlockUpdate {
                block_id: latest_id(),
            },
        );
        fx.drain(CANONIZATION);
        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::BlockAssertion {
                block_id: latest_id(),
            },
        );
        assert_eq!(fx.state.assertion_count(PROTOCOL), 1);

        fx.request(PROTOCOL, 7177, NotifyRequestBody::BlockAssertionCancel);
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].method, NotifyMethod::BlockAssertionCancel);
        assert_eq!(responses[0].offset, 7177);
        assert!(responses[0].payload.is_empty());
        assert_eq!(fx.state.assertion_count(PROTOCOL), 0);

        // Cancelling with nothing outstanding still answers.
        fx.request(PROTOCOL, 9999, NotifyRequestBody::BlockAssertionCancel);
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].offset, 9999);
    }

    #[test]
    fn reduce_caps_locks_out_every_method() {
        let mut fx = fixture();
        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::ReduceCaps {
                caps: CapabilitySet::empty(),
            },
        );
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses[0].status, StatusCode::Success);
        assert_eq!(responses[0].offset, 7177);

        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::BlockUpdate {
                block_id: next_id(),
            },
        );
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses[0].method, NotifyMethod::BlockUpdate);
        assert_eq!(responses[0].status, StatusCode::Unauthorized);
        assert_eq!(responses[0].offset, 7177);
        // The update was refused, so the latest id is unchanged.
        assert_eq!(fx.state.latest_block_id(), Uuid::nil());

        // Even a second reduce is refused now.
        fx.request(
            PROTOCOL,
            7177,
            NotifyRequestBody::ReduceCaps {
                caps: CapabilitySet::full(),
            },
        );
        let responses = fx.drain(PROTOCOL);
        assert_eq!(responses[0].status, StatusCode::Unauthorized);
    }

    #[test]
    fn updates_on_one_connection_do_not_disturb_other_caps() {
        let mut fx = fixture();
        fx.request(
            PROTOCOL,
            1,
            NotifyRequestBody::ReduceCaps {
                caps: CapabilitySet::with_indices(&[
                    NotifyMethod::BlockAssertion.cap_index(),
                    NotifyMethod::BlockAssertionCancel.cap_index(),
                ]),
            },
        );
        fx.drain(PROTOCOL);

        // The canonization connection still holds full capabilities.
        fx.request(
            CANONIZATION,
            2,
            NotifyRequestBody::BlockUpdate {
                block_id: latest_id(),
            },
        );
        let responses = fx.drain(CANONIZATION);
        assert_eq!(responses[0].status, StatusCode::Success);
    }
}

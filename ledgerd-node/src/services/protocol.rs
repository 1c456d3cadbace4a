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

//! The protocol service boundary.
//!
//! Owns every client socket after the listener forwards it. The client-facing
//! authenticated handshake is an external concern; the boundary modeled here
//! starts at "authorized entity id in hand": the service resolves the entity
//! to its capability set, opens a data-service child context scoped to it,
//! and scopes the client's notification traffic to its subscription rights.
//!
//! A client message is a `data` frame whose first byte selects the plane:
//! `0x01` carries a data-service request, `0x02` a notification-service
//! request. Responses travel back with the same plane byte. Notification
//! offsets are translated so that many clients can share the service's one
//! notification connection; invalidations are routed back to the asserting
//! client at its own offset.

use anyhow::Context;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ledgerd::{
    api::{
        data::{DataMethod, DataRequest, DataResponse, DataResponseBody},
        notification::{NotifyMethod, NotifyRequest, NotifyResponse},
    },
    CapabilitySet, StatusCode,
};
use ledgerd_ipc::{Frame, FrameCodec};

use crate::handoff::{FdRole, ServiceKind};
use crate::runtime::{self, signal, Fibers};
use crate::services::data::client::DataClient;
use crate::services::setup::{run_control_setup, AuthorizedEntity};
use crate::supervisor::fdpass;

/// Plane byte for data-service traffic.
pub const PLANE_DATA: u8 = 0x01;
/// Plane byte for notification traffic.
pub const PLANE_NOTIFY: u8 = 0x02;

type DataProxyRequest = (DataRequest, oneshot::Sender<DataResponse>);

/// Serializes all client contexts onto the one data-service connection.
async fn data_proxy_fiber(
    mut data: DataClient,
    mut requests: mpsc::Receiver<DataProxyRequest>,
) -> anyhow::Result<()> {
    data.root_context_create().await?;
    while let Some((request, reply)) = requests.next().await {
        let response = data.call(request).await?;
        // A gone client just means nobody is waiting for this answer.
        reply.send(response).ok();
    }
    Ok(())
}

#[derive(Debug)]
struct NotifyRoute {
    client_offset: u64,
    sink: mpsc::UnboundedSender<NotifyResponse>,
}

#[derive(Debug, Default)]
struct NotifyRouter {
    next_offset: u64,
    routes: HashMap<u64, NotifyRoute>,
}

type SharedRouter = Rc<RefCell<NotifyRouter>>;

impl NotifyRouter {
    fn register(
        &mut self,
        client_offset: u64,
        sink: mpsc::UnboundedSender<NotifyResponse>,
    ) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.routes.insert(
            offset,
            NotifyRoute {
                client_offset,
                sink,
            },
        );
        offset
    }

    fn route(&mut self, response: NotifyResponse) {
        match self.routes.remove(&response.offset) {
            Some(route) => {
                let translated = NotifyResponse {
                    offset: route.client_offset,
                    ..response
                };
                route.sink.unbounded_send(translated).ok();
            }
            None => warn!("notification response for unknown offset {}", response.offset),
        }
    }
}

/// Reads notification responses and routes them to the owning client.
async fn notify_reader_fiber(
    read_half: tokio::net::unix::OwnedReadHalf,
    router: SharedRouter,
) -> anyhow::Result<()> {
    let mut io = tokio_util::codec::FramedRead::new(read_half, FrameCodec::default());
    while let Some(frame) = io.next().await {
        let response = NotifyResponse::decode(&frame?.into_data()?)?;
        router.borrow_mut().route(response);
    }
    Ok(())
}

/// Writes translated notification requests onto the shared connection.
async fn notify_writer_fiber(
    write_half: tokio::net::unix::OwnedWriteHalf,
    mut requests: mpsc::Receiver<NotifyRequest>,
) -> anyhow::Result<()> {
    let mut io = tokio_util::codec::FramedWrite::new(write_half, FrameCodec::default());
    while let Some(request) = requests.next().await {
        io.send(Frame::Data(request.encode())).await?;
    }
    Ok(())
}

struct ClientChannels {
    data_proxy: mpsc::Sender<DataProxyRequest>,
    notify_out: mpsc::Sender<NotifyRequest>,
    router: SharedRouter,
    entities: Rc<HashMap<Uuid, AuthorizedEntity>>,
}

impl Clone for ClientChannels {
    fn clone(&self) -> Self {
        Self {
            data_proxy: self.data_proxy.clone(),
            notify_out: self.notify_out.clone(),
            router: self.router.clone(),
            entities: self.entities.clone(),
        }
    }
}

/// One authorized client's lifecycle.
async fn client_fiber(
    stream: tokio::net::TcpStream,
    channels: ClientChannels,
    fibers: Fibers,
) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio_util::codec::FramedRead::new(read_half, FrameCodec::default());
    let mut writer = tokio_util::codec::FramedWrite::new(write_half, FrameCodec::default());

    // The handshake collaborator has already authenticated the peer; its
    // first frame names the entity it authenticated as.
    let hello = match reader.next().await {
        Some(frame) => frame?.into_data()?,
        None => return Ok(()),
    };
    let entity_id = Uuid::from_slice(&hello).context("client hello")?;
    let entity = match channels.entities.get(&entity_id) {
        Some(entity) => entity.clone(),
        None => {
            debug!("rejecting unknown entity {}", entity_id);
            return Ok(());
        }
    };

    // A child context scoped to the entity's grants; the data service
    // enforces the same bits again.
    let mut channels = channels;
    let child = {
        let (reply_tx, reply_rx) = oneshot::channel();
        channels
            .data_proxy
            .send((
                DataRequest {
                    child: 0,
                    body: ledgerd::api::data::DataRequestBody::ChildContextCreate {
                        caps: entity.caps.clone(),
                    },
                },
                reply_tx,
            ))
            .await?;
        match reply_rx.await?.body {
            ledgerd::api::data::DataResponseBody::Child(child) => child,
            _ => anyhow::bail!("child context create failed for {}", entity_id),
        }
    };

    let (push_tx, mut push_rx) = mpsc::unbounded::<NotifyResponse>();
    let notify_caps = notify_caps_for(&entity.caps);

    let mut state = fibers.state();
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            pushed = push_rx.next() => {
                if let Some(response) = pushed {
                    let mut payload = vec![PLANE_NOTIFY];
                    payload.extend_from_slice(&response.encode());
                    writer.send(Frame::Data(payload)).await?;
                }
                continue;
            }
            shutdown = runtime::shutdown_requested(&mut state) => {
                info!("client {} draining ({:?})", entity_id, shutdown);
                break;
            }
        };
        let payload = match frame {
            Some(frame) => frame?.into_data()?,
            None => break,
        };
        if payload.is_empty() {
            break;
        }

        match payload[0] {
            PLANE_DATA => {
                let mut request = DataRequest::decode(&payload[1..])?;
                // The context id is the service's business, not the
                // client's; context management stays inside the boundary.
                let response = match request.method() {
                    DataMethod::RootContextCreate
                    | DataMethod::RootContextReduceCaps
                    | DataMethod::ChildContextCreate
                    | DataMethod::ChildContextClose => DataResponse {
                        method: request.method(),
                        offset: child,
                        status: StatusCode::Unauthorized,
                        body: DataResponseBody::Empty,
                    },
                    _ => {
                        request.child = child;
                        let (reply_tx, reply_rx) = oneshot::channel();
                        channels.data_proxy.send((request, reply_tx)).await?;
                        reply_rx.await?
                    }
                };
                let mut out = vec![PLANE_DATA];
                out.extend_from_slice(&response.encode());
                writer.send(Frame::Data(out)).await?;
            }
            PLANE_NOTIFY => {
                let request = NotifyRequest::decode(&payload[1..])?;
                let method = request.method();
                if !notify_caps.can(method.cap_index()) {
                    let refusal = NotifyResponse {
                        method,
                        status: StatusCode::Unauthorized,
                        offset: request.offset,
                        payload: Vec::new(),
                    };
                    let mut out = vec![PLANE_NOTIFY];
                    out.extend_from_slice(&refusal.encode());
                    writer.send(Frame::Data(out)).await?;
                    continue;
                }
                let translated = channels
                    .router
                    .borrow_mut()
                    .register(request.offset, push_tx.clone());
                channels
                    .notify_out
                    .send(NotifyRequest {
                        offset: translated,
                        body: request.body,
                    })
                    .await?;
            }
            plane => {
                debug!("client {} sent unknown plane {:#04x}", entity_id, plane);
                break;
            }
        }
    }

    // Release the client's context on the way out.
    let (reply_tx, reply_rx) = oneshot::channel();
    channels
        .data_proxy
        .send((
            DataRequest {
                child,
                body: ledgerd::api::data::DataRequestBody::ChildContextClose,
            },
            reply_tx,
        ))
        .await?;
    reply_rx.await.ok();
    Ok(())
}

/// The notification rights a client's grants imply: clients may assert and
/// cancel, never update, and only when they hold the block-read grant.
fn notify_caps_for(entity_caps: &CapabilitySet) -> CapabilitySet {
    if entity_caps.can(ledgerd::api::data::DataMethod::BlockGet.cap_index()) {
        CapabilitySet::with_indices(&[
            NotifyMethod::BlockAssertion.cap_index(),
            NotifyMethod::BlockAssertionCancel.cap_index(),
        ])
    } else {
        CapabilitySet::empty()
    }
}

/// The accept fiber: receives forwarded client descriptors and spawns a
/// fiber per client.
async fn accept_fiber(
    accept_in: tokio::net::UnixStream,
    channels: ClientChannels,
    fibers: Fibers,
) -> anyhow::Result<()> {
    let mut state = fibers.state();
    loop {
        let stream = tokio::select! {
            stream = fdpass::recv_fd_tcp(&accept_in) => stream?,
            shutdown = runtime::shutdown_requested(&mut state) => {
                info!("protocol service draining ({:?})", shutdown);
                return Ok(());
            }
        };
        fibers.spawn(
            "client",
            client_fiber(stream, channels.clone(), fibers.clone()),
        );
    }
}

/// Entry point for the protocol service process.
pub fn service_entry() -> anyhow::Result<()> {
    signal::block_all_signals()?;
    let accept_fd = ServiceKind::Protocol
        .fd_for(FdRole::AcceptIn)
        .expect("protocol layout has an accept inbox");
    let data_fd = ServiceKind::Protocol
        .fd_for(FdRole::DataOut)
        .expect("protocol layout has a data socket");
    let control_fd = ServiceKind::Protocol
        .fd_for(FdRole::Control)
        .expect("protocol layout has a control socket");

    runtime::run_service(|fibers| async move {
        let signal_sock = signal::spawn_signal_thread(signal::DEFAULT_GRACE)?;
        fibers.spawn("reaper", signal::reaper_fiber(signal_sock, fibers.clone()));

        let mut control = super::framed_from_fd(control_fd)?;
        let setup = run_control_setup(&mut control).await?;
        let entities: Rc<HashMap<Uuid, AuthorizedEntity>> = Rc::new(
            setup
                .entities
                .into_iter()
                .map(|entity| (entity.entity_id, entity))
                .collect(),
        );

        // The notification connection arrives over the control channel.
        let notify_stream = fdpass::recv_fd_stream(control.get_ref()).await?;
        let (notify_read, notify_write) = notify_stream.into_split();

        let router: SharedRouter = Rc::new(RefCell::new(NotifyRouter::default()));
        let (notify_out_tx, notify_out_rx) = mpsc::channel(64);
        fibers.spawn(
            "notify-reader",
            notify_reader_fiber(notify_read, router.clone()),
        );
        fibers.spawn(
            "notify-writer",
            notify_writer_fiber(notify_write, notify_out_rx),
        );

        let (data_proxy_tx, data_proxy_rx) = mpsc::channel(64);
        let data = DataClient::new(super::stream_from_fd(data_fd)?);
        fibers.spawn("data-proxy", data_proxy_fiber(data, data_proxy_rx));

        let channels = ClientChannels {
            data_proxy: data_proxy_tx,
            notify_out: notify_out_tx,
            router,
            entities,
        };
        fibers.spawn(
            "accept",
            accept_fiber(super::stream_from_fd(accept_fd)?, channels, fibers.clone()),
        );
        Ok(())
    })
}

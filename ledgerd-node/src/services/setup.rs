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

//! Control-socket setup shared by the configurable services.
//!
//! A freshly spawned service answers control commands — configuration, key
//! material, authorized entities — acknowledging each one, until the
//! supervisor sends `start`. Whatever arrived by then is the service's
//! operating state.

use anyhow::{anyhow, Context};
use futures::{SinkExt, StreamExt};
use log::warn;
use sodiumoxide::crypto::sign::ed25519;
use tokio_util::codec::Framed;
use uuid::Uuid;

use ledgerd::{
    api::control::{ControlAck, ControlCommand, ServiceConfig},
    CapabilitySet, StatusCode,
};
use ledgerd_ipc::{Frame, FrameCodec, FrameError};

/// The service's signing identity.
#[derive(Debug, Clone)]
pub struct SigningIdentity {
    /// Entity id the service signs as.
    pub entity_id: Uuid,
    /// Verification key.
    pub public_key: ed25519::PublicKey,
    /// Signing key.
    pub secret_key: ed25519::SecretKey,
}

/// An authorized public entity.
#[derive(Debug, Clone)]
pub struct AuthorizedEntity {
    /// Entity id.
    pub entity_id: Uuid,
    /// Verification key.
    pub public_key: ed25519::PublicKey,
    /// The entity's capability set.
    pub caps: CapabilitySet,
}

/// Everything a service received before `start`.
#[derive(Debug)]
pub struct ControlSetup {
    /// Runtime configuration.
    pub config: ServiceConfig,
    /// Signing identity, for the services that are keyed.
    pub identity: Option<SigningIdentity>,
    /// Authorized entities.
    pub entities: Vec<AuthorizedEntity>,
}

/// Runs the configure phase: answers control commands until `start`.
pub async fn run_control_setup(
    io: &mut Framed<tokio::net::UnixStream, FrameCodec>,
) -> anyhow::Result<ControlSetup> {
    let mut setup = ControlSetup {
        config: ServiceConfig::default(),
        identity: None,
        entities: Vec::new(),
    };

    loop {
        let frame = io.next().await.ok_or(FrameError::PeerClosed)??;
        let command = ControlCommand::decode(&frame.into_data()?)?;
        let id = command.id();

        let status = match command {
            ControlCommand::ConfigSet(config) => {
                setup.config = config;
                StatusCode::Success
            }
            ControlCommand::PrivateKeySet {
                entity_id,
                public_key,
                secret_key,
            } => match parse_identity(entity_id, &public_key, &secret_key) {
                Ok(identity) => {
                    setup.identity = Some(identity);
                    StatusCode::Success
                }
                Err(err) => {
                    warn!("rejecting private key: {:#}", err);
                    StatusCode::Malformed
                }
            },
            ControlCommand::EntityAdd {
                entity_id,
                public_key,
                caps,
            } => match ed25519::PublicKey::from_slice(&public_key) {
                Some(public_key) => {
                    setup.entities.push(AuthorizedEntity {
                        entity_id,
                        public_key,
                        caps,
                    });
                    StatusCode::Success
                }
                None => StatusCode::Malformed,
            },
            ControlCommand::Start => {
                let ack = ControlAck {
                    command: id,
                    status: StatusCode::Success,
                };
                io.send(Frame::Data(ack.encode())).await?;
                return Ok(setup);
            }
        };

        let ack = ControlAck {
            command: id,
            status,
        };
        io.send(Frame::Data(ack.encode())).await?;
    }
}

fn parse_identity(
    entity_id: Uuid,
    public_key: &[u8],
    secret_key: &[u8],
) -> anyhow::Result<SigningIdentity> {
    let public_key = ed25519::PublicKey::from_slice(public_key)
        .ok_or_else(|| anyhow!("bad public key length"))
        .context("parsing signing identity")?;
    let secret_key = ed25519::SecretKey::from_slice(secret_key)
        .ok_or_else(|| anyhow!("bad secret key length"))
        .context("parsing signing identity")?;
    Ok(SigningIdentity {
        entity_id,
        public_key,
        secret_key,
    })
}

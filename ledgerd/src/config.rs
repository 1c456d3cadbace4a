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

//! Agent configuration and the privilege-separated reader stream.
//!
//! The supervisor never parses the config file itself: a throwaway child
//! parses it after dropping privileges and streams the result back as
//! BOM/EOM-delimited records, each field an IPC frame. The same framing
//! carries key material and public-entity certificates from their reader
//! children.

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::io::{Read, Write};

use ledgerd_ipc::{sync, Frame, FrameError};

use crate::caps::CapabilityTriple;

/// Begin-of-message tag in a reader stream.
pub const TAG_BOM: u8 = 0x00;
/// End-of-message tag in a reader stream.
pub const TAG_EOM: u8 = 0xff;

/// Record tags in a reader stream.
pub mod record {
    /// Log directory.
    pub const LOGDIR: u8 = 0x01;
    /// Log level.
    pub const LOGLEVEL: u8 = 0x02;
    /// A listen address (host string + port).
    pub const LISTEN_ADDR: u8 = 0x03;
    /// Chroot directory.
    pub const CHROOT: u8 = 0x04;
    /// Unprivileged user and group.
    pub const USERGROUP: u8 = 0x05;
    /// Canonization tick in milliseconds.
    pub const BLOCK_MAX_MILLISECONDS: u8 = 0x06;
    /// Cap on transactions per block.
    pub const BLOCK_MAX_TRANSACTIONS: u8 = 0x07;
    /// Private key filename.
    pub const PRIVATE_KEY: u8 = 0x08;
    /// Endorser key filename.
    pub const ENDORSER_KEY: u8 = 0x09;
    /// Public key filename.
    pub const PUBLIC_KEY: u8 = 0x0a;
    /// A public entity certificate with its capability triples.
    pub const ENTITY: u8 = 0x0b;
    /// Private key material (id + key pair).
    pub const PRIVATE_KEY_MATERIAL: u8 = 0x0c;
}

/// Errors reading a reader stream.
#[derive(Debug, Error)]
pub enum ConfigStreamError {
    /// Framing failed.
    #[error("config stream framing error: {0}")]
    Frame(#[from] FrameError),
    /// The stream violated the record grammar.
    #[error("config stream is invalid: {0}")]
    Invalid(&'static str),
}

/// An address the listener binds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenAddr {
    /// Host or address to bind.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// The unprivileged identity services run as.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserGroup {
    /// User name.
    pub user: String,
    /// Group name.
    pub group: String,
}

/// The agent configuration, as parsed from the TOML config file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Directory for service logs.
    #[serde(default = "default_logdir")]
    pub logdir: String,
    /// Log verbosity, 0-4.
    #[serde(default = "default_loglevel")]
    pub loglevel: u64,
    /// Listen addresses.
    #[serde(default)]
    pub listen: Vec<ListenAddr>,
    /// Chroot directory for services.
    #[serde(default)]
    pub chroot: Option<String>,
    /// Unprivileged identity for services.
    #[serde(default)]
    pub usergroup: Option<UserGroup>,
    /// Canonization tick in milliseconds.
    #[serde(default = "default_block_max_milliseconds")]
    pub block_max_milliseconds: u64,
    /// Cap on transactions per block.
    #[serde(default = "default_block_max_transactions")]
    pub block_max_transactions: u64,
    /// Private key filename.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Endorser key filename.
    #[serde(default)]
    pub endorser_key: Option<String>,
    /// Public entity key filenames.
    #[serde(default)]
    pub public_keys: Vec<String>,
}

fn default_logdir() -> String {
    "log".to_owned()
}

fn default_loglevel() -> u64 {
    3
}

fn default_block_max_milliseconds() -> u64 {
    5000
}

fn default_block_max_transactions() -> u64 {
    500
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            logdir: default_logdir(),
            loglevel: default_loglevel(),
            listen: Vec::new(),
            chroot: None,
            usergroup: None,
            block_max_milliseconds: default_block_max_milliseconds(),
            block_max_transactions: default_block_max_transactions(),
            private_key: None,
            endorser_key: None,
            public_keys: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Parses a TOML config document.
    pub fn from_toml(doc: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(doc)
    }

    /// Streams the configuration as reader records, terminated by a
    /// top-level EOM.
    pub fn write_stream<W: Write>(&self, writer: &mut W) -> Result<(), ConfigStreamError> {
        write_record(writer, record::LOGDIR, &[Frame::String(self.logdir.clone())])?;
        write_record(writer, record::LOGLEVEL, &[Frame::U64(self.loglevel)])?;
        for addr in &self.listen {
            write_record(
                writer,
                record::LISTEN_ADDR,
                &[
                    Frame::String(addr.host.clone()),
                    Frame::U64(u64::from(addr.port)),
                ],
            )?;
        }
        if let Some(chroot) = &self.chroot {
            write_record(writer, record::CHROOT, &[Frame::String(chroot.clone())])?;
        }
        if let Some(usergroup) = &self.usergroup {
            write_record(
                writer,
                record::USERGROUP,
                &[
                    Frame::String(usergroup.user.clone()),
                    Frame::String(usergroup.group.clone()),
                ],
            )?;
        }
        write_record(
            writer,
            record::BLOCK_MAX_MILLISECONDS,
            &[Frame::U64(self.block_max_milliseconds)],
        )?;
        write_record(
            writer,
            record::BLOCK_MAX_TRANSACTIONS,
            &[Frame::U64(self.block_max_transactions)],
        )?;
        if let Some(file) = &self.private_key {
            write_record(writer, record::PRIVATE_KEY, &[Frame::String(file.clone())])?;
        }
        if let Some(file) = &self.endorser_key {
            write_record(writer, record::ENDORSER_KEY, &[Frame::String(file.clone())])?;
        }
        for file in &self.public_keys {
            write_record(writer, record::PUBLIC_KEY, &[Frame::String(file.clone())])?;
        }
        sync::write_frame(writer, &Frame::U8(TAG_EOM))?;
        Ok(())
    }

    /// Reads a configuration stream produced by [`write_stream`](Self::write_stream).
    pub fn read_stream<R: Read>(reader: &mut R) -> Result<Self, ConfigStreamError> {
        let mut config = AgentConfig::default();
        config.listen.clear();
        config.public_keys.clear();

        loop {
            match sync::read_u8(reader)? {
                TAG_EOM => return Ok(config),
                TAG_BOM => {}
                _ => return Err(ConfigStreamError::Invalid("expected BOM or EOM")),
            }

            let tag = sync::read_u8(reader)?;
            match tag {
                record::LOGDIR => {
                    config.logdir = sync::read_string(reader)?;
                }
                record::LOGLEVEL => {
                    config.loglevel = sync::read_u64(reader)?;
                }
                record::LISTEN_ADDR => {
                    let host = sync::read_string(reader)?;
                    let port = sync::read_u64(reader)?;
                    if port > u64::from(u16::max_value()) {
                        return Err(ConfigStreamError::Invalid("listen port out of range"));
                    }
                    config.listen.push(ListenAddr {
                        host,
                        port: port as u16,
                    });
                }
                record::CHROOT => {
                    config.chroot = Some(sync::read_string(reader)?);
                }
                record::USERGROUP => {
                    config.usergroup = Some(UserGroup {
                        user: sync::read_string(reader)?,
                        group: sync::read_string(reader)?,
                    });
                }
                record::BLOCK_MAX_MILLISECONDS => {
                    config.block_max_milliseconds = sync::read_u64(reader)?;
                }
                record::BLOCK_MAX_TRANSACTIONS => {
                    config.block_max_transactions = sync::read_u64(reader)?;
                }
                record::PRIVATE_KEY => {
                    config.private_key = Some(sync::read_string(reader)?);
                }
                record::ENDORSER_KEY => {
                    config.endorser_key = Some(sync::read_string(reader)?);
                }
                record::PUBLIC_KEY => {
                    config.public_keys.push(sync::read_string(reader)?);
                }
                _ => return Err(ConfigStreamError::Invalid("unknown record tag")),
            }

            expect_eom(reader)?;
        }
    }
}

/// A public entity streamed by the entity reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEntityRecord {
    /// The attested entity certificate.
    pub cert: Vec<u8>,
    /// The entity's (subject, verb, object) grants.
    pub caps: Vec<CapabilityTriple>,
}

/// Writes one public entity record.
pub fn write_entity_record<W: Write>(
    writer: &mut W,
    entity: &PublicEntityRecord,
) -> Result<(), ConfigStreamError> {
    sync::write_frame(writer, &Frame::U8(TAG_BOM))?;
    sync::write_frame(writer, &Frame::U8(record::ENTITY))?;
    sync::write_frame(writer, &Frame::Data(entity.cert.clone()))?;
    sync::write_frame(writer, &Frame::U64(entity.caps.len() as u64))?;
    for triple in &entity.caps {
        sync::write_frame(writer, &Frame::U8(TAG_BOM))?;
        sync::write_frame(writer, &Frame::Data(triple.subject.as_bytes().to_vec()))?;
        sync::write_frame(writer, &Frame::Data(triple.verb.as_bytes().to_vec()))?;
        sync::write_frame(writer, &Frame::Data(triple.object.as_bytes().to_vec()))?;
        sync::write_frame(writer, &Frame::U8(TAG_EOM))?;
    }
    sync::write_frame(writer, &Frame::U8(TAG_EOM))?;
    Ok(())
}

/// Reads entity records until the top-level EOM.
pub fn read_entity_records<R: Read>(
    reader: &mut R,
) -> Result<Vec<PublicEntityRecord>, ConfigStreamError> {
    let mut entities = Vec::new();
    loop {
        match sync::read_u8(reader)? {
            TAG_EOM => return Ok(entities),
            TAG_BOM => {}
            _ => return Err(ConfigStreamError::Invalid("expected BOM or EOM")),
        }
        if sync::read_u8(reader)? != record::ENTITY {
            return Err(ConfigStreamError::Invalid("expected entity record"));
        }

        let cert = sync::read_data(reader)?;
        let count = sync::read_u64(reader)?;
        let mut caps = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if sync::read_u8(reader)? != TAG_BOM {
                return Err(ConfigStreamError::Invalid("expected capability BOM"));
            }
            let subject = read_uuid_frame(reader)?;
            let verb = read_uuid_frame(reader)?;
            let object = read_uuid_frame(reader)?;
            expect_eom(reader)?;
            caps.push(CapabilityTriple {
                subject,
                verb,
                object,
            });
        }
        expect_eom(reader)?;
        entities.push(PublicEntityRecord { cert, caps });
    }
}

/// Private key material streamed by the key reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyMaterial {
    /// The entity id of this agent.
    pub entity_id: Uuid,
    /// Raw ed25519 public key.
    pub public_key: Vec<u8>,
    /// Raw ed25519 secret key.
    pub secret_key: Vec<u8>,
}

/// Writes the private key record followed by the top-level EOM.
pub fn write_private_key<W: Write>(
    writer: &mut W,
    material: &PrivateKeyMaterial,
) -> Result<(), ConfigStreamError> {
    sync::write_frame(writer, &Frame::U8(TAG_BOM))?;
    sync::write_frame(writer, &Frame::U8(record::PRIVATE_KEY_MATERIAL))?;
    sync::write_frame(writer, &Frame::Data(material.entity_id.as_bytes().to_vec()))?;
    sync::write_frame(writer, &Frame::Data(material.public_key.clone()))?;
    sync::write_frame(writer, &Frame::Data(material.secret_key.clone()))?;
    sync::write_frame(writer, &Frame::U8(TAG_EOM))?;
    sync::write_frame(writer, &Frame::U8(TAG_EOM))?;
    Ok(())
}

/// Reads the private key record.
pub fn read_private_key<R: Read>(reader: &mut R) -> Result<PrivateKeyMaterial, ConfigStreamError> {
    if sync::read_u8(reader)? != TAG_BOM {
        return Err(ConfigStreamError::Invalid("expected BOM"));
    }
    if sync::read_u8(reader)? != record::PRIVATE_KEY_MATERIAL {
        return Err(ConfigStreamError::Invalid("expected private key record"));
    }
    let entity_id = read_uuid_frame(reader)?;
    let public_key = sync::read_data(reader)?;
    let secret_key = sync::read_data(reader)?;
    expect_eom(reader)?;
    expect_eom(reader)?;
    Ok(PrivateKeyMaterial {
        entity_id,
        public_key,
        secret_key,
    })
}

fn write_record<W: Write>(
    writer: &mut W,
    tag: u8,
    fields: &[Frame],
) -> Result<(), ConfigStreamError> {
    sync::write_frame(writer, &Frame::U8(TAG_BOM))?;
    sync::write_frame(writer, &Frame::U8(tag))?;
    for field in fields {
        sync::write_frame(writer, field)?;
    }
    sync::write_frame(writer, &Frame::U8(TAG_EOM))?;
    Ok(())
}

fn expect_eom<R: Read>(reader: &mut R) -> Result<(), ConfigStreamError> {
    if sync::read_u8(reader)? != TAG_EOM {
        return Err(ConfigStreamError::Invalid("expected EOM"));
    }
    Ok(())
}

fn read_uuid_frame<R: Read>(reader: &mut R) -> Result<Uuid, ConfigStreamError> {
    let raw = sync::read_data(reader)?;
    Uuid::from_slice(&raw).map_err(|_| ConfigStreamError::Invalid("bad uuid field"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::io::Cursor;

    use super::*;

    const SAMPLE: &str = r#"
        logdir = "log"
        loglevel = 4
        chroot = "/opt/ledgerd"
        block_max_milliseconds = 1
        block_max_transactions = 10
        private_key = "keys/agent.priv"
        endorser_key = "keys/endorser.pub"
        public_keys = ["keys/a.pub", "keys/b.pub"]

        [[listen]]
        host = "0.0.0.0"
        port = 4931

        [usergroup]
        user = "ledgerd"
        group = "ledgerd"
    "#;

    #[test]
    fn toml_parses() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.loglevel, 4);
        assert_eq!(config.listen.len(), 1);
        assert_eq!(config.listen[0].port, 4931);
        assert_eq!(config.block_max_transactions, 10);
        assert_eq!(config.public_keys.len(), 2);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config = AgentConfig::from_toml("").unwrap();
        assert_eq!(config.block_max_milliseconds, 5000);
        assert_eq!(config.block_max_transactions, 500);
        assert!(config.chroot.is_none());
    }

    #[test]
    fn stream_round_trip() {
        let config = AgentConfig::from_toml(SAMPLE).unwrap();
        let mut buf = Vec::new();
        config.write_stream(&mut buf).unwrap();
        let decoded = AgentConfig::read_stream(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn entity_stream_round_trip() {
        let entity = PublicEntityRecord {
            cert: vec![1, 2, 3, 4],
            caps: vec![CapabilityTriple {
                subject: Uuid::from_bytes([1; 16]),
                verb: Uuid::from_bytes([2; 16]),
                object: Uuid::from_bytes([3; 16]),
            }],
        };
        let mut buf = Vec::new();
        write_entity_record(&mut buf, &entity).unwrap();
        sync::write_frame(&mut buf, &Frame::U8(TAG_EOM)).unwrap();

        let decoded = read_entity_records(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, vec![entity]);
    }

    #[test]
    fn private_key_stream_round_trip() {
        let material = PrivateKeyMaterial {
            entity_id: Uuid::from_bytes([9; 16]),
            public_key: vec![1; 32],
            secret_key: vec![2; 64],
        };
        let mut buf = Vec::new();
        write_private_key(&mut buf, &material).unwrap();
        let decoded = read_private_key(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, material);
    }

    #[test]
    fn garbage_stream_is_invalid() {
        let mut buf = Vec::new();
        sync::write_frame(&mut buf, &Frame::U8(0x33)).unwrap();
        match AgentConfig::read_stream(&mut Cursor::new(buf)) {
            Err(ConfigStreamError::Invalid(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

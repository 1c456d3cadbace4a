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

//! Privilege-separated reader children.
//!
//! The supervisor never parses the config file, key material or entity
//! certificates as root. Each is handled by a throwaway child that drops
//! privileges, chroots, keeps only descriptor 0 (its input) and descriptor 1
//! (the stream back to the supervisor), and streams BOM/EOM records. The
//! supervisor reads the stream, then waits on the child and treats a
//! non-zero exit as a fatal startup error.
//!
//! Both halves live here: `spawn_*` run in the supervisor, `child_*` are the
//! private subcommand bodies.

use anyhow::{bail, Context};
use serde_derive::Deserialize;
use sodiumoxide::crypto::sign::ed25519;
use uuid::Uuid;

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::Path;
use std::process::{Command, Stdio};

use ledgerd::caps::CapabilityTriple;
use ledgerd::cert::{field, Certificate};
use ledgerd::config::{
    read_entity_records, read_private_key, write_entity_record, write_private_key, AgentConfig,
    PrivateKeyMaterial, PublicEntityRecord, UserGroup, TAG_EOM,
};
use ledgerd_ipc::{sync, Frame};

use crate::privsep;

/// The on-disk private key document.
#[derive(Debug, Deserialize)]
struct KeyFile {
    entity_id: String,
    public_key: String,
    secret_key: String,
}

fn spawn_reader(
    exe: &Path,
    subcommand: &str,
    input: File,
    extra_args: &[&str],
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<(std::os::unix::net::UnixStream, std::process::Child)> {
    let (ours, theirs) =
        std::os::unix::net::UnixStream::pair().context("creating the reader socket pair")?;

    let mut command = Command::new(exe);
    command.arg(subcommand);
    command.args(extra_args);
    if let Some(chroot) = chroot {
        command.args(&["--chroot", chroot]);
    }
    if let Some(usergroup) = usergroup {
        command.args(&["--user", &usergroup.user]);
        command.args(&["--group", &usergroup.group]);
    }
    command.stdin(Stdio::from(input));
    // The stream back to the supervisor rides on descriptor 1.
    command.stdout(unsafe { Stdio::from_raw_fd(theirs.into_raw_fd()) });

    let child = command
        .spawn()
        .with_context(|| format!("spawning the {} reader", subcommand))?;
    Ok((ours, child))
}

fn wait_reader(mut child: std::process::Child, what: &str) -> anyhow::Result<()> {
    let status = child.wait().context("waiting on a reader child")?;
    if !status.success() {
        bail!("{} reader exited with {}", what, status);
    }
    Ok(())
}

/// Reads the agent configuration through a reader child.
pub fn read_config_via_child(
    exe: &Path,
    config_path: &Path,
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<AgentConfig> {
    let input = File::open(config_path)
        .with_context(|| format!("opening {}", config_path.display()))?;
    let (mut stream, child) =
        spawn_reader(exe, "private:readconfig", input, &[], chroot, usergroup)?;
    let config = AgentConfig::read_stream(&mut stream).context("reading the config stream")?;
    wait_reader(child, "config")?;
    Ok(config)
}

/// Reads the agent's private key material through a reader child.
pub fn read_private_key_via_child(
    exe: &Path,
    key_path: &Path,
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<PrivateKeyMaterial> {
    let input =
        File::open(key_path).with_context(|| format!("opening {}", key_path.display()))?;
    let (mut stream, child) = spawn_reader(
        exe,
        "private:read-private-key",
        input,
        &[],
        chroot,
        usergroup,
    )?;
    let material = read_private_key(&mut stream).context("reading the key stream")?;
    wait_reader(child, "private key")?;
    Ok(material)
}

/// A decoded public entity, ready for `entity-add` commands.
#[derive(Debug, Clone)]
pub struct PublicEntity {
    /// Entity id.
    pub entity_id: Uuid,
    /// Raw verification key bytes.
    pub public_key: Vec<u8>,
    /// The entity's grants.
    pub caps: Vec<CapabilityTriple>,
}

/// Reads and attests the public entity certificates through a reader child.
///
/// The first file is the endorser; every subsequent certificate must carry
/// the endorser's signature.
pub fn read_public_entities_via_child(
    exe: &Path,
    endorser_path: &str,
    entity_paths: &[String],
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<Vec<PublicEntity>> {
    let input = File::open(endorser_path)
        .with_context(|| format!("opening {}", endorser_path))?;
    let args: Vec<&str> = entity_paths.iter().map(String::as_str).collect();
    let (mut stream, child) = spawn_reader(
        exe,
        "private:read-public-entities",
        input,
        &args,
        chroot,
        usergroup,
    )?;
    let records = read_entity_records(&mut stream).context("reading the entity stream")?;
    wait_reader(child, "public entities")?;

    records.iter().map(decode_entity).collect()
}

fn decode_entity(record: &PublicEntityRecord) -> anyhow::Result<PublicEntity> {
    let cert = Certificate::parse(&record.cert).context("parsing an entity certificate")?;
    let entity_id = cert
        .get_uuid(field::ENTITY_ID)
        .context("entity certificate id")?;
    let public_key = cert
        .find(field::ENTITY_PUBLIC_KEY)
        .context("entity certificate key")?
        .to_vec();
    Ok(PublicEntity {
        entity_id,
        public_key,
        caps: record.caps.clone(),
    })
}

// ---------------------------------------------------------------------------
// Child bodies.
// ---------------------------------------------------------------------------

fn reader_io() -> (impl Read, impl Write) {
    // Descriptor 0 is the input, descriptor 1 the stream back.
    let input = unsafe { File::from_raw_fd(0) };
    let output = unsafe { File::from_raw_fd(1) };
    (input, io::BufWriter::new(output))
}

fn enter_jail(chroot: Option<&str>, usergroup: Option<&UserGroup>) -> anyhow::Result<()> {
    privsep::drop_privileges(chroot, usergroup)?;
    privsep::close_extra_fds(&[0, 1, 2]);
    Ok(())
}

/// Body of the `readconfig` private subcommand.
pub fn child_readconfig(
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<()> {
    enter_jail(chroot, usergroup)?;
    let (mut input, mut output) = reader_io();

    let mut doc = String::new();
    input
        .read_to_string(&mut doc)
        .context("reading the config file")?;
    let config = AgentConfig::from_toml(&doc).context("parsing the config file")?;
    config.write_stream(&mut output)?;
    output.flush().context("flushing the config stream")?;
    Ok(())
}

/// Body of the `read-private-key` private subcommand.
pub fn child_read_private_key(
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<()> {
    enter_jail(chroot, usergroup)?;
    let (mut input, mut output) = reader_io();

    let mut doc = String::new();
    input
        .read_to_string(&mut doc)
        .context("reading the key file")?;
    let parsed: KeyFile = toml::from_str(&doc).context("parsing the key file")?;

    let entity_raw = hex::decode(&parsed.entity_id).context("decoding the entity id")?;
    let material = PrivateKeyMaterial {
        entity_id: Uuid::from_slice(&entity_raw).context("branding the entity id")?,
        public_key: hex::decode(&parsed.public_key).context("decoding the public key")?,
        secret_key: hex::decode(&parsed.secret_key).context("decoding the secret key")?,
    };
    if ed25519::PublicKey::from_slice(&material.public_key).is_none()
        || ed25519::SecretKey::from_slice(&material.secret_key).is_none()
    {
        bail!("key file carries malformed key material");
    }

    write_private_key(&mut output, &material)?;
    output.flush().context("flushing the key stream")?;
    Ok(())
}

/// Body of the `read-public-entities` private subcommand.
///
/// Descriptor 0 carries the endorser certificate; the remaining entity
/// certificate paths arrive as arguments and are opened after the chroot.
pub fn child_read_public_entities(
    entity_paths: &[String],
    chroot: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<()> {
    privsep::drop_privileges(chroot, usergroup)?;
    let (mut input, mut output) = reader_io();

    let mut endorser_raw = Vec::new();
    input
        .read_to_end(&mut endorser_raw)
        .context("reading the endorser certificate")?;

    // The endorser attests itself; everyone else is attested by it.
    let endorser_cert =
        Certificate::parse(&endorser_raw).context("parsing the endorser certificate")?;
    let endorser_key = ed25519::PublicKey::from_slice(
        endorser_cert
            .find(field::ENTITY_PUBLIC_KEY)
            .context("endorser key field")?,
    )
    .context("endorser key width")?;
    endorser_cert
        .attest(&endorser_key)
        .context("attesting the endorser certificate")?;
    write_entity_record(&mut output, &entity_record(&endorser_cert, &endorser_raw)?)?;

    for path in entity_paths {
        let mut raw = Vec::new();
        File::open(path)
            .with_context(|| format!("opening {}", path))?
            .read_to_end(&mut raw)
            .with_context(|| format!("reading {}", path))?;
        let cert = Certificate::parse(&raw).with_context(|| format!("parsing {}", path))?;
        cert.attest(&endorser_key)
            .with_context(|| format!("attesting {}", path))?;
        write_entity_record(&mut output, &entity_record(&cert, &raw)?)?;
    }

    sync::write_frame(&mut output, &Frame::U8(TAG_EOM))?;
    output.flush().context("flushing the entity stream")?;
    Ok(())
}

fn entity_record(cert: &Certificate<'_>, raw: &[u8]) -> anyhow::Result<PublicEntityRecord> {
    let mut caps = Vec::new();
    for triple_raw in cert.find_all(field::ENTITY_CAP_TRIPLE) {
        if triple_raw.len() != 48 {
            bail!("malformed capability triple");
        }
        caps.push(CapabilityTriple {
            subject: Uuid::from_slice(&triple_raw[0..16])?,
            verb: Uuid::from_slice(&triple_raw[16..32])?,
            object: Uuid::from_slice(&triple_raw[32..48])?,
        });
    }
    Ok(PublicEntityRecord {
        cert: raw.to_vec(),
        caps,
    })
}

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

//! The supervisor.
//!
//! Reads configuration and key material through privilege-separated reader
//! children, creates every inter-service socket pair and bound listen
//! socket, spawns the fleet in dependency order with each service's
//! descriptors remapped to its well-known numbers, configures and starts the
//! configurable services over their control sockets, and then blocks in
//! `sigwait`.
//!
//! On a signal the fleet is shut down in two stages and reaped. On an
//! unexpected child exit the whole fleet is torn down and rebuilt, up to a
//! bounded number of restarts; past the budget the supervisor gives up and
//! exits, taking the agent down.

use anyhow::{bail, Context};
use log::{error, info, warn};
use nix::sys::signal::{SigSet, Signal};

use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use ledgerd::api::control::{ControlCommand, ServiceConfig};
use ledgerd::api::data::caps_from_triples;
use ledgerd::config::AgentConfig;

use crate::handoff::{FdRole, Handoff, ServiceKind};
use crate::supervisor::process::{Process, ServiceState};
use crate::supervisor::readers::PublicEntity;

pub mod fdpass;
pub mod process;
pub mod readers;

/// Restart budget before the supervisor gives up.
const MAX_RESTARTS: u32 = 5;

/// Drain time before the ordered stop begins.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Gap between the two stop stages.
const SHUTDOWN_GAP: Duration = Duration::from_secs(2);

const RANDOM_DEVICE: &str = "/dev/urandom";

/// Supervisor launch options.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Path to the agent configuration file.
    pub config_path: PathBuf,
    /// Path to the ledgerd binary used for private subcommands.
    pub exe: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// A shutdown signal arrived.
    Signalled,
    /// A service exited unexpectedly.
    ChildFailed,
}

/// Runs the supervisor until a shutdown signal or the restart budget is
/// exhausted.
pub fn run(options: &SupervisorOptions) -> anyhow::Result<()> {
    crate::runtime::signal::block_all_signals()?;

    let mut restarts = 0_u32;
    loop {
        match run_once(options) {
            Ok(Outcome::Signalled) => {
                info!("supervisor shutting down cleanly");
                return Ok(());
            }
            Ok(Outcome::ChildFailed) => {
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    bail!("restart budget exhausted after {} attempts", restarts - 1);
                }
                warn!("service failure; restarting the fleet (attempt {})", restarts);
            }
            Err(err) => return Err(err),
        }
    }
}

fn run_once(options: &SupervisorOptions) -> anyhow::Result<Outcome> {
    // Stage one: privilege-separated reads. The config reader runs before
    // the chroot and user are known.
    let config = readers::read_config_via_child(&options.exe, &options.config_path, None, None)?;
    let chroot = config.chroot.as_deref();
    let usergroup = config.usergroup.as_ref();

    let entities = match &config.endorser_key {
        Some(endorser) => readers::read_public_entities_via_child(
            &options.exe,
            endorser,
            &config.public_keys,
            chroot,
            usergroup,
        )?,
        None => Vec::new(),
    };
    let key_material = match &config.private_key {
        Some(path) => Some(readers::read_private_key_via_child(
            &options.exe,
            std::path::Path::new(path),
            chroot,
            usergroup,
        )?),
        None => None,
    };

    if config.listen.is_empty() {
        bail!("configuration names no listen addresses");
    }

    // Stage two: build the fleet. Any error here tears down whatever was
    // already created, in reverse order.
    let mut fleet = match Fleet::build(options, &config, &entities, key_material.as_ref()) {
        Ok(fleet) => fleet,
        Err(err) => {
            error!("fleet startup failed: {:#}", err);
            return Err(err);
        }
    };

    // Stage three: wait for a signal or a child exit.
    let mut waitset = SigSet::empty();
    for signal in &[
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
        Signal::SIGCHLD,
    ] {
        waitset.add(*signal);
    }

    let outcome = loop {
        let signal = waitset.wait().context("waiting for signals")?;
        match signal {
            Signal::SIGCHLD => {
                if fleet.any_service_exited() {
                    break Outcome::ChildFailed;
                }
            }
            other => {
                info!("supervisor caught {}", other);
                break Outcome::Signalled;
            }
        }
    };

    fleet.shutdown();
    Ok(outcome)
}

/// Everything created for one fleet incarnation: the processes plus the
/// supervisor-held socket ends that must outlive the spawns.
struct Fleet {
    processes: Vec<Process>,
    // Held open for the lifetime of the fleet (log read ends, auth peer).
    _guards: Vec<UnixStream>,
}

impl Fleet {
    fn build(
        options: &SupervisorOptions,
        config: &AgentConfig,
        entities: &[PublicEntity],
        key_material: Option<&ledgerd::config::PrivateKeyMaterial>,
    ) -> anyhow::Result<Self> {
        let exe = &options.exe;
        let chroot = config.chroot.as_deref();
        let usergroup = config.usergroup.as_ref();
        let mut guards = Vec::new();
        let mut processes: Vec<Process> = Vec::new();

        // A helper that tears down everything already spawned when any later
        // step fails.
        let spawned = &mut processes;
        let result = (|| -> anyhow::Result<()> {
            // Every socket pair in the fabric, created up front.
            let (random_proto_svc, random_proto_client) = pair()?;
            let (random_canon_svc, random_canon_client) = pair()?;
            let (listener_forward_svc, listener_forward_client) = pair()?;
            let (data_auth_svc, data_auth_client) = pair()?;
            let (data_canon_svc, data_canon_client) = pair()?;
            let (data_attest_svc, data_attest_client) = pair()?;
            let (notify_canon_svc, notify_canon_client) = pair()?;
            let (notify_proto_svc, notify_proto_client) = pair()?;
            let (auth_peer, auth_svc) = pair()?;
            guards.push(auth_peer);

            let (proto_control_theirs, proto_control_ours) = pair()?;
            let (canon_control_theirs, canon_control_ours) = pair()?;
            let (attest_control_theirs, attest_control_ours) = pair()?;
            let (auth_control_theirs, auth_control_ours) = pair()?;

            let logs = LogSockets::new(&config.logdir)?;

            let random_device = std::fs::File::open(RANDOM_DEVICE)
                .with_context(|| format!("opening {}", RANDOM_DEVICE))?;

            let listeners: Vec<TcpListener> = config
                .listen
                .iter()
                .map(|addr| {
                    TcpListener::bind((addr.host.as_str(), addr.port))
                        .with_context(|| format!("binding {}:{}", addr.host, addr.port))
                })
                .collect::<anyhow::Result<_>>()?;

            // Spawn in dependency order, leaves first.
            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::RandomDevice, random_device.as_raw_fd())
                .push(FdRole::ProtocolClient, random_proto_svc.as_raw_fd())
                .push(FdRole::Log, logs.random.as_raw_fd())
                .push(FdRole::CanonizationClient, random_canon_svc.as_raw_fd());
            spawned.push(Process::spawn(
                "random",
                ServiceKind::Random,
                exe,
                &handoff,
                chroot,
                usergroup,
                None,
            )?);

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::Log, logs.listener.as_raw_fd())
                .push(FdRole::AcceptForward, listener_forward_svc.as_raw_fd());
            for listener in &listeners {
                handoff.push(FdRole::Listen, listener.as_raw_fd());
            }
            spawned.push(Process::spawn(
                "listener",
                ServiceKind::Listener,
                exe,
                &handoff,
                chroot,
                usergroup,
                None,
            )?);

            for (name, svc_end, log_end) in &[
                ("data-auth", &data_auth_svc, &logs.data_auth),
                ("data-canonization", &data_canon_svc, &logs.data_canon),
            ] {
                let mut handoff = Handoff::new();
                handoff
                    .push(FdRole::Request, svc_end.as_raw_fd())
                    .push(FdRole::Log, log_end.as_raw_fd());
                spawned.push(Process::spawn(
                    *name,
                    ServiceKind::Data,
                    exe,
                    &handoff,
                    chroot,
                    usergroup,
                    None,
                )?);
            }

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::Log, logs.notification.as_raw_fd())
                .push(FdRole::CanonizationClient, notify_canon_svc.as_raw_fd())
                .push(FdRole::ProtocolClient, notify_proto_svc.as_raw_fd());
            spawned.push(Process::spawn(
                "notification",
                ServiceKind::Notification,
                exe,
                &handoff,
                chroot,
                usergroup,
                None,
            )?);

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::AcceptIn, listener_forward_client.as_raw_fd())
                .push(FdRole::Log, logs.protocol.as_raw_fd())
                .push(FdRole::DataOut, data_auth_client.as_raw_fd())
                .push(FdRole::RandomOut, random_proto_client.as_raw_fd())
                .push(FdRole::Control, proto_control_theirs.as_raw_fd());
            spawned.push(Process::spawn(
                "protocol",
                ServiceKind::Protocol,
                exe,
                &handoff,
                chroot,
                usergroup,
                Some(proto_control_ours),
            )?);

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::Request, auth_svc.as_raw_fd())
                .push(FdRole::Log, logs.auth.as_raw_fd())
                .push(FdRole::Control, auth_control_theirs.as_raw_fd());
            spawned.push(Process::spawn(
                "auth",
                ServiceKind::Auth,
                exe,
                &handoff,
                chroot,
                usergroup,
                Some(auth_control_ours),
            )?);

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::Request, data_attest_svc.as_raw_fd())
                .push(FdRole::Log, logs.data_attest.as_raw_fd());
            spawned.push(Process::spawn(
                "data-attestation",
                ServiceKind::Data,
                exe,
                &handoff,
                chroot,
                usergroup,
                None,
            )?);

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::Log, logs.canonization.as_raw_fd())
                .push(FdRole::DataOut, data_canon_client.as_raw_fd())
                .push(FdRole::RandomOut, random_canon_client.as_raw_fd())
                .push(FdRole::Control, canon_control_theirs.as_raw_fd());
            spawned.push(Process::spawn(
                "canonization",
                ServiceKind::Canonization,
                exe,
                &handoff,
                chroot,
                usergroup,
                Some(canon_control_ours),
            )?);

            let mut handoff = Handoff::new();
            handoff
                .push(FdRole::Log, logs.attestation.as_raw_fd())
                .push(FdRole::DataOut, data_attest_client.as_raw_fd())
                .push(FdRole::Control, attest_control_theirs.as_raw_fd());
            spawned.push(Process::spawn(
                "attestation",
                ServiceKind::Attestation,
                exe,
                &handoff,
                chroot,
                usergroup,
                Some(attest_control_ours),
            )?);

            // Configure, key and start the configurable services; everyone
            // else is running from spawn.
            let service_config = ServiceConfig {
                block_max_milliseconds: config.block_max_milliseconds,
                block_max_transactions: config.block_max_transactions,
                attestation_tick_milliseconds: 5000,
            };
            let config_cmd = ControlCommand::ConfigSet(service_config);

            let key_cmd = key_material.map(|material| ControlCommand::PrivateKeySet {
                entity_id: material.entity_id,
                public_key: material.public_key.clone(),
                secret_key: material.secret_key.clone(),
            });
            let entity_cmds: Vec<ControlCommand> = entities
                .iter()
                .map(|entity| ControlCommand::EntityAdd {
                    entity_id: entity.entity_id,
                    public_key: entity.public_key.clone(),
                    caps: caps_from_triples(&entity.caps),
                })
                .collect();

            for process in spawned.iter_mut() {
                match process.kind {
                    ServiceKind::Protocol | ServiceKind::Attestation => {
                        process.configure(&config_cmd)?;
                        for cmd in &entity_cmds {
                            process.send_command(cmd)?;
                        }
                        process.start()?;
                    }
                    ServiceKind::Canonization | ServiceKind::Auth => {
                        process.configure(&config_cmd)?;
                        let key_cmd = key_cmd
                            .as_ref()
                            .context("a keyed service needs private key material")?;
                        process.deliver_key(key_cmd)?;
                        process.start()?;
                    }
                    _ => process.mark_running()?,
                }
            }

            // Hand the notification client sockets across, now that both
            // receivers are started and listening on their control sockets.
            for process in spawned.iter_mut() {
                match process.kind {
                    ServiceKind::Canonization => {
                        let control = process.control.as_ref().expect("canonization has control");
                        fdpass::send_fd(control.as_raw_fd(), notify_canon_client.as_raw_fd())?;
                    }
                    ServiceKind::Protocol => {
                        let control = process.control.as_ref().expect("protocol has control");
                        fdpass::send_fd(control.as_raw_fd(), notify_proto_client.as_raw_fd())?;
                    }
                    _ => {}
                }
            }

            info!("fleet of {} services running", spawned.len());
            Ok(())
        })();

        match result {
            Ok(()) => Ok(Self {
                processes,
                _guards: guards,
            }),
            Err(err) => {
                // Reverse construction order, as far as we got.
                error!("tearing down a partially built fleet: {:#}", err);
                for process in processes.iter_mut().rev() {
                    process.kill_hard();
                    process.reap_blocking();
                }
                Err(err)
            }
        }
    }

    fn any_service_exited(&mut self) -> bool {
        let mut failed = false;
        for process in self.processes.iter_mut() {
            if process.state == ServiceState::Reaped {
                continue;
            }
            if let Some(status) = process.try_reap() {
                warn!("{} exited unexpectedly: {:?}", process.name, status);
                failed = true;
            }
        }
        failed
    }

    /// The ordered two-stage shutdown.
    fn shutdown(&mut self) {
        thread::sleep(SHUTDOWN_DRAIN);

        // Leaf services first, in the prescribed order.
        for kind in &[
            ServiceKind::Auth,
            ServiceKind::Listener,
            ServiceKind::Protocol,
            ServiceKind::Canonization,
            ServiceKind::Attestation,
            ServiceKind::Notification,
        ] {
            for process in self.processes.iter_mut().filter(|p| p.kind == *kind) {
                process.stop();
            }
        }
        thread::sleep(SHUTDOWN_GAP);

        for kind in &[ServiceKind::Data, ServiceKind::Random] {
            for process in self.processes.iter_mut().filter(|p| p.kind == *kind) {
                process.stop();
            }
        }

        // Give the two-stage in-service shutdown a moment, then make sure.
        thread::sleep(SHUTDOWN_GAP + crate::runtime::signal::DEFAULT_GRACE);
        for process in self.processes.iter_mut() {
            if process.try_reap().is_none() && process.state != ServiceState::Reaped {
                process.kill_hard();
            }
        }
        for process in self.processes.iter_mut() {
            process.reap_blocking();
        }
        info!("fleet reaped");
    }
}

struct LogSockets {
    random: UnixStream,
    listener: UnixStream,
    data_auth: UnixStream,
    data_canon: UnixStream,
    data_attest: UnixStream,
    notification: UnixStream,
    protocol: UnixStream,
    canonization: UnixStream,
    attestation: UnixStream,
    auth: UnixStream,
}

impl LogSockets {
    fn new(logdir: &str) -> anyhow::Result<Self> {
        let mut make = |name: &'static str| -> anyhow::Result<UnixStream> {
            let (theirs, ours) = pair()?;
            spawn_log_drain(name, ours, logdir);
            Ok(theirs)
        };
        Ok(Self {
            random: make("random")?,
            listener: make("listener")?,
            data_auth: make("data-auth")?,
            data_canon: make("data-canonization")?,
            data_attest: make("data-attestation")?,
            notification: make("notification")?,
            protocol: make("protocol")?,
            canonization: make("canonization")?,
            attestation: make("attestation")?,
            auth: make("auth")?,
        })
    }
}

/// Drains one service's log socket into the log directory. The thread ends
/// when the service closes its end.
fn spawn_log_drain(name: &'static str, mut sock: UnixStream, logdir: &str) {
    use std::io::{Read, Write};

    let path = std::path::Path::new(logdir).join(format!("{}.log", name));
    thread::Builder::new()
        .name(format!("log-{}", name))
        .spawn(move || {
            // An unwritable log directory must not block the service, so the
            // drain falls back to discarding.
            let mut out: Box<dyn Write> = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => Box::new(file),
                Err(_) => Box::new(std::io::sink()),
            };
            let mut buf = [0_u8; 4096];
            loop {
                match sock.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        out.write_all(&buf[..n]).ok();
                    }
                }
            }
        })
        .ok();
}

fn pair() -> anyhow::Result<(UnixStream, UnixStream)> {
    UnixStream::pair().context("creating a socket pair")
}

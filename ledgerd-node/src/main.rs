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

//! The ledgerd binary.
//!
//! `ledgerd start` runs the supervisor, which re-execs this same binary with
//! the `private:*` subcommands to run each service and reader child. The
//! private surface is an implementation detail and hidden from help output.

use log::error;
use structopt::StructOpt;

use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::process::exit;

use ledgerd::config::UserGroup;
use ledgerd::status::ExitCode;
use ledgerd_ipc::FrameError;
use ledgerd_node::handoff::{FdRole, ServiceKind};
use ledgerd_node::supervisor::{self, readers, SupervisorOptions};
use ledgerd_node::{privsep, services};

#[derive(Debug, StructOpt)]
struct JailOpts {
    /// Directory to chroot into before serving.
    #[structopt(long)]
    chroot: Option<String>,
    /// Unprivileged user to drop to.
    #[structopt(long)]
    user: Option<String>,
    /// Unprivileged group to drop to.
    #[structopt(long)]
    group: Option<String>,
}

impl JailOpts {
    fn usergroup(&self) -> Option<UserGroup> {
        match (&self.user, &self.group) {
            (Some(user), Some(group)) => Some(UserGroup {
                user: user.clone(),
                group: group.clone(),
            }),
            _ => None,
        }
    }

    fn enter(&self) -> anyhow::Result<()> {
        privsep::drop_privileges(self.chroot.as_deref(), self.usergroup().as_ref())
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "ledgerd", about = "The ledgerd blockchain agent.")]
enum Command {
    /// Start the agent: spawn and supervise the service fleet.
    #[structopt(name = "start")]
    Start {
        /// Path to the agent configuration file.
        #[structopt(short = "c", long = "config", default_value = "ledgerd.conf")]
        config: PathBuf,
    },

    #[structopt(name = "private:data", setting = structopt::clap::AppSettings::Hidden)]
    PrivateData(JailOpts),
    #[structopt(name = "private:listen", setting = structopt::clap::AppSettings::Hidden)]
    PrivateListen(JailOpts),
    #[structopt(name = "private:notification", setting = structopt::clap::AppSettings::Hidden)]
    PrivateNotification(JailOpts),
    #[structopt(name = "private:protocol", setting = structopt::clap::AppSettings::Hidden)]
    PrivateProtocol(JailOpts),
    #[structopt(name = "private:auth", setting = structopt::clap::AppSettings::Hidden)]
    PrivateAuth(JailOpts),
    #[structopt(name = "private:canonization", setting = structopt::clap::AppSettings::Hidden)]
    PrivateCanonization(JailOpts),
    #[structopt(name = "private:attestation", setting = structopt::clap::AppSettings::Hidden)]
    PrivateAttestation(JailOpts),
    #[structopt(name = "private:random", setting = structopt::clap::AppSettings::Hidden)]
    PrivateRandom(JailOpts),
    #[structopt(name = "private:readconfig", setting = structopt::clap::AppSettings::Hidden)]
    PrivateReadConfig(JailOpts),
    #[structopt(name = "private:read-private-key", setting = structopt::clap::AppSettings::Hidden)]
    PrivateReadPrivateKey(JailOpts),
    #[structopt(name = "private:read-public-entities", setting = structopt::clap::AppSettings::Hidden)]
    PrivateReadPublicEntities {
        #[structopt(flatten)]
        jail: JailOpts,
        /// Entity certificate paths, opened after the chroot.
        entity_paths: Vec<String>,
    },
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Start { config } => {
            let exe = std::env::current_exe()?;
            supervisor::run(&SupervisorOptions {
                config_path: config,
                exe,
            })
        }
        Command::PrivateData(jail) => {
            jail.enter()?;
            services::data::service_entry()
        }
        Command::PrivateListen(jail) => {
            jail.enter()?;
            services::listener::service_entry()
        }
        Command::PrivateNotification(jail) => {
            jail.enter()?;
            services::notification::service_entry()
        }
        Command::PrivateProtocol(jail) => {
            jail.enter()?;
            services::protocol::service_entry()
        }
        Command::PrivateAuth(jail) => {
            jail.enter()?;
            services::auth::service_entry()
        }
        Command::PrivateCanonization(jail) => {
            jail.enter()?;
            services::canonization::service_entry()
        }
        Command::PrivateAttestation(jail) => {
            jail.enter()?;
            services::attestation::service_entry()
        }
        Command::PrivateRandom(jail) => {
            jail.enter()?;
            services::random::service_entry()
        }
        Command::PrivateReadConfig(jail) => {
            readers::child_readconfig(jail.chroot.as_deref(), jail.usergroup().as_ref())
        }
        Command::PrivateReadPrivateKey(jail) => {
            readers::child_read_private_key(jail.chroot.as_deref(), jail.usergroup().as_ref())
        }
        Command::PrivateReadPublicEntities { jail, entity_paths } => {
            readers::child_read_public_entities(
                &entity_paths,
                jail.chroot.as_deref(),
                jail.usergroup().as_ref(),
            )
        }
    }
}

/// Maps a failure to the stage-partitioned exit codes.
fn classify(err: &anyhow::Error) -> ExitCode {
    if let Some(frame_err) = err.downcast_ref::<FrameError>() {
        return match frame_err {
            FrameError::PeerClosed => ExitCode::PeerClosed,
            FrameError::Io(_) | FrameError::ShortRead | FrameError::WouldBlock => {
                ExitCode::IpcReadFailure
            }
            _ => ExitCode::IpcReadFailure,
        };
    }
    if err
        .downcast_ref::<ledgerd::config::ConfigStreamError>()
        .is_some()
    {
        return ExitCode::ConfigStreamInvalid;
    }
    let rendered = format!("{:#}", err);
    if rendered.contains("chroot") || rendered.contains("dropping") {
        ExitCode::PrivsepFailure
    } else {
        ExitCode::ServiceStartFailure
    }
}

/// The service kind a private subcommand runs, if any.
fn service_kind(command: &Command) -> Option<ServiceKind> {
    match command {
        Command::PrivateData(_) => Some(ServiceKind::Data),
        Command::PrivateListen(_) => Some(ServiceKind::Listener),
        Command::PrivateNotification(_) => Some(ServiceKind::Notification),
        Command::PrivateProtocol(_) => Some(ServiceKind::Protocol),
        Command::PrivateAuth(_) => Some(ServiceKind::Auth),
        Command::PrivateCanonization(_) => Some(ServiceKind::Canonization),
        Command::PrivateAttestation(_) => Some(ServiceKind::Attestation),
        Command::PrivateRandom(_) => Some(ServiceKind::Random),
        _ => None,
    }
}

/// Service processes log onto their log socket (stderr is a service socket
/// after the descriptor remap); everything else logs to stderr.
fn init_logging(command: &Command) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(fd) = service_kind(command).and_then(|kind| kind.fd_for(FdRole::Log)) {
        let log_sock = unsafe { std::fs::File::from_raw_fd(fd) };
        builder.target(env_logger::Target::Pipe(Box::new(log_sock)));
    }
    builder.init();
}

fn main() {
    let command = Command::from_args();
    init_logging(&command);
    match run(command) {
        Ok(()) => exit(ExitCode::Success.code()),
        Err(err) => {
            error!("{:#}", err);
            exit(classify(&err).code())
        }
    }
}

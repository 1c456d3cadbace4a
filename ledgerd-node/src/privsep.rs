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

//! Privilege separation helpers.
//!
//! Services and reader children run as an unprivileged user inside a chroot
//! and keep only the descriptors they were handed. The order matters:
//! chroot while still privileged, then drop the group, then the user.

use anyhow::{bail, Context};
use nix::unistd::{self, Group, Uid, User};

use std::os::unix::io::RawFd;

use ledgerd::config::UserGroup;

// Descriptors above this are assumed closed already; services keep their
// inherited set well below it.
const MAX_CLOSE_FD: RawFd = 1024;

/// Enters `chroot_dir` (if set) and drops to the configured user/group.
///
/// A no-op for either part that is not configured, which keeps local
/// development runs as a plain user possible.
pub fn drop_privileges(
    chroot_dir: Option<&str>,
    usergroup: Option<&UserGroup>,
) -> anyhow::Result<()> {
    if let Some(dir) = chroot_dir {
        unistd::chroot(dir).with_context(|| format!("chroot into {}", dir))?;
        unistd::chdir("/").context("chdir after chroot")?;
    }

    if let Some(usergroup) = usergroup {
        let group = Group::from_name(&usergroup.group)
            .context("resolving group")?
            .with_context(|| format!("unknown group {}", usergroup.group))?;
        let user = User::from_name(&usergroup.user)
            .context("resolving user")?
            .with_context(|| format!("unknown user {}", usergroup.user))?;

        unistd::setgid(group.gid).context("dropping group")?;
        unistd::setuid(user.uid).context("dropping user")?;

        // Regaining root after the drop is a configuration error.
        if Uid::effective().is_root() && !user.uid.is_root() {
            bail!("privilege drop did not take effect");
        }
    }

    Ok(())
}

/// Closes every descriptor outside `keep`.
pub fn close_extra_fds(keep: &[RawFd]) {
    for fd in 0..MAX_CLOSE_FD {
        if !keep.contains(&fd) {
            let _ = unistd::close(fd);
        }
    }
}

//! Copyright (c) 2024-2025 Hyflux, Inc.
//!
//! This file is part of Hyflux
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use daemonize::Daemonize;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{access, AccessFlags, Pid};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// daemon process configuration
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// process id file path
    pid_path: String,
    /// error log file path
    error_log: Option<String>,
    /// unix username permission
    user: Option<String>,
    /// unix group permission
    group: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_path: String::from("/tmp/prefork.pid"),
            error_log: None,
            user: None,
            group: None,
        }
    }
}

impl DaemonConfig {
    pub fn with_pid_path(mut self, path: &str) -> Self {
        self.pid_path = path.to_string();
        self
    }

    pub fn with_error_log(mut self, path: &str) -> Self {
        self.error_log = Some(path.to_string());
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn pid_path(&self) -> &str {
        &self.pid_path
    }
}

/// what an existing pid file says about a previous supervisor
#[derive(Debug, PartialEq, Eq)]
enum PidFile {
    Absent,
    /// left behind by a supervisor that is gone, or unreadable
    Stale,
    Running(Pid),
}

fn inspect_pid_file(path: &Path) -> PidFile {
    if !path.exists() {
        return PidFile::Absent;
    }
    let pid = match fs::read_to_string(path) {
        Ok(content) => content.trim().parse::<i32>().ok().filter(|pid| *pid > 0),
        Err(_) => None,
    };
    match pid.map(Pid::from_raw) {
        // EPERM: alive, just owned by another user
        Some(pid) => match kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) => PidFile::Running(pid),
            Err(_) => PidFile::Stale,
        },
        None => PidFile::Stale,
    }
}

/// make sure this supervisor may write the pid file
///
/// a live supervisor holding the file is an error, a stale file is moved
/// to `<path>.old`.
fn claim_pid_file(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    access(dir, AccessFlags::W_OK).map_err(|e| {
        Error::Daemon(format!("pid file directory {} is not writable: {e}", dir.display()))
    })?;
    match inspect_pid_file(path) {
        PidFile::Absent => Ok(()),
        PidFile::Running(pid) => Err(Error::Daemon(format!(
            "supervisor already running as pid {pid}, see {}",
            path.display()
        ))),
        PidFile::Stale => {
            let old = PathBuf::from(format!("{}.old", path.display()));
            match fs::rename(path, &old) {
                Ok(_) => info!("stale pid file moved to {}", old.display()),
                Err(e) => warn!("failed to move stale pid file {}: {e}", path.display()),
            }
            Ok(())
        }
    }
}

/// primary group of the given user, the user has to exist
fn user_gid(user: &CString) -> Result<libc::gid_t> {
    let passwd = unsafe { libc::getpwnam(user.as_ptr()) };
    if passwd.is_null() {
        return Err(Error::Daemon(format!(
            "unknown daemon user {}",
            user.to_string_lossy()
        )));
    }
    Ok(unsafe { (*passwd).pw_gid })
}

fn open_error_log(path: &str) -> Result<File> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok(file)
}

/// check the configuration & prepare the daemonize builder, nothing forks yet
fn build(config: &DaemonConfig) -> Result<Daemonize<()>> {
    let daemonize = Daemonize::new().umask(0o007).pid_file(&config.pid_path);
    let daemonize = match config.error_log.as_deref() {
        Some(error_log) => daemonize.stderr(open_error_log(error_log)?),
        None => daemonize,
    };
    // drop to the user, with its supplementary groups
    let daemonize = match config.user.as_ref() {
        Some(user) => {
            let user_cstr = CString::new(user.as_str())
                .map_err(|_| Error::Daemon(format!("invalid user name: {user:?}")))?;
            let gid = user_gid(&user_cstr)?;
            daemonize
                .privileged_action(move || unsafe {
                    libc::initgroups(user_cstr.as_ptr(), gid);
                })
                .user(user.as_str())
                .chown_pid_file(true)
        }
        None => daemonize,
    };
    let daemonize = match config.group.as_ref() {
        Some(group) => daemonize.group(group.as_str()),
        None => daemonize,
    };
    Ok(daemonize)
}

/// detach the supervisor from the terminal
///
/// must run before the listener is bound & before any runtime exists,
/// the process forks and only the daemonized child returns.
pub fn daemonize_server(config: &DaemonConfig) -> Result<()> {
    let daemonize = build(config)?;
    claim_pid_file(Path::new(&config.pid_path))?;
    daemonize.start().map_err(|e| {
        error!("failed to daemonize supervisor: {e}");
        Error::Daemon(e.to_string())
    })?;
    info!(pid_file = %config.pid_path, "supervisor daemonized");
    Ok(())
}

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

//! fork-based lifecycle tests, every test binds its own ephemeral port

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getppid, ForkResult, Pid};
use tokio::io::AsyncReadExt;

use prefork_core::network::connection::Connection;
use prefork_core::server::process::TerminationReason;
use prefork_core::server::supervisor::Shutdown as Stopped;
use prefork_core::{
    BoxError, Config, Error, NoopInitializer, RequestHandler, ResourceInitializer, ShutdownMode,
    Supervisor,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn scratch_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("prefork-{}-{name}", std::process::id()));
    let _ = fs::remove_file(&path);
    path
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(format!("{line}\n").as_bytes())
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|content| content.lines().map(String::from).collect())
        .unwrap_or_default()
}

fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

fn local_config(workers: usize) -> Config {
    Config::default()
        .with_bind_address("127.0.0.1:0")
        .with_worker_count(workers)
}

/// records `<pid> <request>` for every connection it serves
struct RecordingHandler {
    log: PathBuf,
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle(&self, mut connection: Connection) {
        let mut request = Vec::new();
        if connection.read_to_end(&mut request).await.is_ok() {
            let line = format!("{} {}", std::process::id(), String::from_utf8_lossy(&request));
            let _ = append_line(&self.log, &line);
        }
    }
}

#[test]
fn spawns_every_worker_and_initializes_each_once() {
    let init_log = scratch_file("init-once");
    let log = init_log.clone();
    let initializer = move |pool_size: usize| -> Result<(), BoxError> {
        append_line(&log, &format!("{} {pool_size}", std::process::id()))?;
        Ok(())
    };
    let handler = RecordingHandler {
        log: scratch_file("init-once-requests"),
    };
    let mut supervisor = Supervisor::new(local_config(3).with_pool_size(10), handler, initializer);
    supervisor.bind().unwrap();
    supervisor.spawn_workers().unwrap();

    assert_eq!(supervisor.workers().len(), 3);
    assert_eq!(supervisor.active_workers(), 3);
    assert!(wait_until(|| read_lines(&init_log).len() >= 3));
    // give a misbehaving worker the chance to initialize twice
    std::thread::sleep(Duration::from_millis(100));

    let lines = read_lines(&init_log);
    assert_eq!(lines.len(), 3);
    let worker_pids: HashSet<String> = supervisor
        .workers()
        .iter()
        .map(|w| w.pid().to_string())
        .collect();
    let init_pids: HashSet<String> = lines
        .iter()
        .map(|line| {
            let (pid, pool_size) = line.split_once(' ').unwrap();
            assert_eq!(pool_size, "10");
            pid.to_string()
        })
        .collect();
    assert_eq!(init_pids, worker_pids);

    assert_eq!(supervisor.forward_signal(Signal::SIGINT).unwrap(), 3);
    let reaped = supervisor.wait_all().unwrap();
    assert_eq!(reaped.len(), 3);
    for (_, reason) in reaped {
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGINT));
    }
    assert_eq!(supervisor.active_workers(), 0);
    let _ = fs::remove_file(init_log);
}

#[test]
fn exited_worker_is_not_signalled_or_respawned() {
    let marker = scratch_file("first-fails");
    let claim = marker.clone();
    // exactly one worker wins the marker & fails its initialization
    let initializer = move |_: usize| -> Result<(), BoxError> {
        match OpenOptions::new().write(true).create_new(true).open(&claim) {
            Ok(_) => Err("simulated initialization failure".into()),
            Err(_) => Ok(()),
        }
    };
    let handler = RecordingHandler {
        log: scratch_file("first-fails-requests"),
    };
    let mut supervisor = Supervisor::new(local_config(2), handler, initializer);
    supervisor.bind().unwrap();
    supervisor.spawn_workers().unwrap();

    let mut exited = Vec::new();
    assert!(wait_until(|| {
        exited.extend(supervisor.reap_exited().unwrap());
        !exited.is_empty()
    }));
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0].1, TerminationReason::Exited(1));
    assert_eq!(supervisor.active_workers(), 1);
    assert_eq!(supervisor.workers().len(), 2);

    assert_eq!(supervisor.forward_signal(Signal::SIGTERM).unwrap(), 1);
    let reaped = supervisor.wait_all().unwrap();
    assert_eq!(reaped.len(), 1);
    assert_ne!(reaped[0].0, exited[0].0);
    assert_eq!(reaped[0].1, TerminationReason::Signaled(Signal::SIGTERM));
    assert_eq!(supervisor.workers().len(), 2);
    let _ = fs::remove_file(marker);
}

#[test]
fn one_request_is_served_by_exactly_one_worker() {
    let requests = scratch_file("end-to-end");
    let handler = RecordingHandler {
        log: requests.clone(),
    };
    let mut supervisor = Supervisor::new(local_config(2), handler, NoopInitializer);
    let address = supervisor.bind().unwrap();
    supervisor.spawn_workers().unwrap();

    let mut client = TcpStream::connect(address).unwrap();
    client.write_all(b"hello").unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    let _ = client.read_to_end(&mut reply);

    assert!(wait_until(|| !read_lines(&requests).is_empty()));
    std::thread::sleep(Duration::from_millis(200));
    let lines = read_lines(&requests);
    assert_eq!(lines.len(), 1);
    let (pid, body) = lines[0].split_once(' ').unwrap();
    assert_eq!(body, "hello");
    assert!(supervisor
        .workers()
        .iter()
        .any(|w| w.pid().to_string() == pid));

    assert_eq!(supervisor.forward_signal(Signal::SIGTERM).unwrap(), 2);
    for (_, reason) in supervisor.wait_all().unwrap() {
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
    }

    // the socket is still open in this process, but nobody serves it anymore
    if let Ok(mut late) = TcpStream::connect(address) {
        let _ = late.write_all(b"late");
        let _ = late.shutdown(Shutdown::Write);
    }
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(read_lines(&requests).len(), 1);
    let _ = fs::remove_file(requests);
}

#[test]
fn second_bind_on_same_address_fails_without_workers() {
    let first_handler = RecordingHandler {
        log: scratch_file("bind-first"),
    };
    let mut first = Supervisor::new(local_config(1), first_handler, NoopInitializer);
    let address = first.bind().unwrap();

    let config = local_config(2).with_bind_address(&address.to_string());
    let second_handler = RecordingHandler {
        log: scratch_file("bind-second"),
    };
    let second = Supervisor::new(config, second_handler, NoopInitializer);
    match second.start() {
        Err(Error::Bind { source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse)
        }
        other => panic!("expected bind conflict, got {other:?}"),
    }
    assert!(first.workers().is_empty());
}

/// supervisor exit codes when it runs in its own process
const SIGNALLED: i32 = 0;
const ALL_EXITED: i32 = 2;
const FAILED: i32 = 1;

/// fork a process that runs the whole `Supervisor::start` lifecycle
fn start_in_process<R: ResourceInitializer>(config: Config, initializer: R, name: &str) -> Pid {
    let handler = RecordingHandler {
        log: scratch_file(name),
    };
    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            let code = match Supervisor::new(config, handler, initializer).start() {
                Ok(Stopped::Signalled(_)) => SIGNALLED,
                Ok(Stopped::AllExited) => ALL_EXITED,
                Err(_) => FAILED,
            };
            unsafe { libc::_exit(code) }
        }
    }
}

fn wait_for_exit(pid: Pid) -> WaitStatus {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)).unwrap() {
            WaitStatus::StillAlive => {}
            status => return status,
        }
        if Instant::now() >= deadline {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            panic!("supervisor {pid} did not stop");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// false once the process is gone or a zombie nobody reaped yet
fn is_alive(pid: &str) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => {
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next());
            !matches!(state, Some('Z') | Some('X'))
        }
        Err(_) => false,
    }
}

/// initializer recording the pid of every worker that runs it
fn pid_recorder(log: PathBuf) -> impl FnMut(usize) -> Result<(), BoxError> {
    move |_| {
        append_line(&log, &std::process::id().to_string())?;
        Ok(())
    }
}

#[test]
fn terminate_forwards_to_workers_then_detaches() {
    let pids = scratch_file("detach-pids");
    let config = local_config(2).with_shutdown_mode(ShutdownMode::Detach);
    let supervisor = start_in_process(config, pid_recorder(pids.clone()), "detach-requests");

    assert!(wait_until(|| read_lines(&pids).len() == 2));
    kill(supervisor, Signal::SIGTERM).unwrap();
    assert_eq!(wait_for_exit(supervisor), WaitStatus::Exited(supervisor, SIGNALLED));

    // nobody waits for them, they still have to die from the forwarded signal
    let workers = read_lines(&pids);
    assert!(wait_until(|| workers.iter().all(|pid| !is_alive(pid))));
    let _ = fs::remove_file(pids);
}

#[test]
fn interrupt_forwards_to_workers_then_reaps_them() {
    let pids = scratch_file("reap-pids");
    let config = local_config(2).with_shutdown_mode(ShutdownMode::Reap);
    let supervisor = start_in_process(config, pid_recorder(pids.clone()), "reap-requests");

    assert!(wait_until(|| read_lines(&pids).len() == 2));
    kill(supervisor, Signal::SIGINT).unwrap();
    assert_eq!(wait_for_exit(supervisor), WaitStatus::Exited(supervisor, SIGNALLED));

    // reaped before the supervisor returned
    for pid in read_lines(&pids) {
        assert!(!is_alive(&pid), "worker {pid} outlived the supervisor");
    }
    let _ = fs::remove_file(pids);
}

#[test]
fn termination_while_spawning_reaches_every_worker() {
    let pids = scratch_file("spawn-window-pids");
    let marker = scratch_file("spawn-window-marker");
    let log = pids.clone();
    // the first worker to initialize signals the supervisor, usually while
    // the remaining workers are still being forked
    let initializer = move |_: usize| -> Result<(), BoxError> {
        append_line(&log, &std::process::id().to_string())?;
        if OpenOptions::new().write(true).create_new(true).open(&marker).is_ok() {
            kill(getppid(), Signal::SIGTERM)?;
        }
        Ok(())
    };
    let config = local_config(4).with_shutdown_mode(ShutdownMode::Reap);
    let supervisor = start_in_process(config, initializer, "spawn-window-requests");

    // in reap mode returning means every recorded worker was signalled & reaped
    assert_eq!(wait_for_exit(supervisor), WaitStatus::Exited(supervisor, SIGNALLED));
    for pid in read_lines(&pids) {
        assert!(!is_alive(&pid), "worker {pid} missed the signal");
    }
    let _ = fs::remove_file(pids);
    let _ = fs::remove_file(scratch_file("spawn-window-marker"));
}

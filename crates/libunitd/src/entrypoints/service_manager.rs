//! The manager's main loop: assemble the [`Manager`], open the control
//! socket, and multiplex control traffic, child exits, job deadlines, and
//! timer elapses on one thread.

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Instant;

use log::{error, info, warn};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::broker::OsProcessBroker;
use crate::config::Config;
use crate::control::ControlServer;
use crate::jobs::{JobKind, JobMode};
use crate::manager::{Manager, Objective};
use crate::signal_handler;

/// How long to sleep in poll when no deadline is pending. Signals arriving
/// during the sleep interrupt it; this is only the fallback cadence.
const IDLE_POLL_MS: u16 = 500;

pub fn run_service_manager(mut config: Config, deserialized: Option<String>, test: bool) -> i32 {
    config.prune_missing_unit_dirs();
    let default_target = config.default_target.clone();

    let mut manager = Manager::new(config, Box::new(OsProcessBroker));
    manager.load_all();

    if let Some(blob) = deserialized {
        info!("re-adopting serialized state");
        manager.deserialize_state(&blob);
    }

    if test {
        return run_test_mode(&mut manager, &default_target);
    }

    let mut control = match ControlServer::open(&manager.config.control_socket.clone()) {
        Ok(control) => control,
        Err(e) => {
            warn!(
                "cannot open control socket {:?}: {e}; continuing without control interface",
                manager.config.control_socket
            );
            ControlServer::disabled()
        }
    };

    let mut signals = match Signals::new([SIGCHLD, SIGTERM, SIGINT, SIGQUIT]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("cannot install signal handlers: {e}");
            return 1;
        }
    };

    match manager.enqueue_job(JobKind::Start, &default_target, JobMode::Replace, false) {
        Ok(job) => info!("started default target {default_target} as job {job}"),
        Err(e) => error!("cannot queue default target {default_target}: {e}"),
    }

    loop {
        let timeout_ms = poll_timeout_ms(&manager);
        poll_fds(&control, timeout_ms);

        let mut objective = control.service(&mut manager);

        for signal in signals.pending() {
            match signal {
                SIGCHLD => {
                    for (pid, termination) in signal_handler::drain_exited_children() {
                        manager.notify_child_exit(pid, termination);
                    }
                }
                SIGTERM | SIGINT | SIGQUIT => {
                    info!("received termination signal, exiting");
                    objective = Some(Objective::Exit);
                }
                _ => {}
            }
        }

        manager.tick(Instant::now());

        if manager.config.show_status {
            print_status_lines(&manager);
        }

        match objective.or(manager.objective.take()) {
            Some(Objective::Reload) => {
                manager.reload();
                // The reply goes out only now that the rescan is complete.
                control.flush_deferred();
            }
            Some(Objective::Reexecute) => {
                control.flush_deferred();
                control.flush_events(&mut manager);
                reexecute(&manager);
                // Only reached when the exec failed.
            }
            Some(Objective::Exit) => {
                control.flush_deferred();
                control.flush_events(&mut manager);
                return 0;
            }
            None => {}
        }

        control.flush_events(&mut manager);
    }
}

/// `--test`: load units, compute the default-target transaction, dump the
/// world, change nothing.
fn run_test_mode(manager: &mut Manager, default_target: &str) -> i32 {
    use crate::jobs::Transaction;

    let mut loader = crate::units::loading::FragmentLoader::new(manager.config.unit_dirs.clone());

    match Transaction::build(
        &mut manager.registry,
        &mut loader,
        JobKind::Start,
        default_target,
        JobMode::Replace,
        false,
    ) {
        Ok(tx) => {
            let mut kinds: Vec<(String, &'static str)> = tx
                .job_kinds()
                .into_iter()
                .map(|(id, kind)| (id.name, kind.as_str()))
                .collect();
            kinds.sort();
            println!("-> transaction for {default_target}:");
            for (unit, kind) in kinds {
                println!("\t{kind} {unit}");
            }
        }
        Err(e) => {
            error!("cannot compute startup transaction: {e}");
            return 1;
        }
    }
    print!("{}", manager.dump());
    0
}

/// Boot-time status lines, one per completed job.
fn print_status_lines(manager: &Manager) {
    use crate::jobs::{BusEvent, JobResult};

    for event in &manager.bus_events {
        if let BusEvent::JobRemoved { unit, result, .. } = event {
            let (tag, color) = match result {
                JobResult::Done => ("  OK  ", "\x1b[32m"),
                JobResult::Skipped => (" SKIP ", "\x1b[33m"),
                _ => ("FAILED", "\x1b[31m"),
            };
            let description = manager
                .registry
                .get(&unit.name)
                .map(|u| {
                    if u.description.is_empty() {
                        u.id.name.clone()
                    } else {
                        u.description.clone()
                    }
                })
                .unwrap_or_else(|| unit.name.clone());
            println!("[{color}{tag}\x1b[0m] {description}");
        }
    }
}

fn poll_timeout_ms(manager: &Manager) -> u16 {
    match manager.next_wakeup() {
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                0
            } else {
                deadline
                    .duration_since(now)
                    .as_millis()
                    .min(u128::from(IDLE_POLL_MS)) as u16
            }
        }
        None => IDLE_POLL_MS,
    }
}

fn poll_fds(control: &ControlServer, timeout_ms: u16) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let raw_fds = control.fds();
    // Poll is purely a sleep-until-readable; the actual reads happen in
    // ControlServer::service with non-blocking IO.
    let borrowed: Vec<BorrowedFd> = raw_fds
        .iter()
        .map(|fd| unsafe { BorrowedFd::borrow_raw(*fd) })
        .collect();
    let mut poll_fds: Vec<PollFd> = borrowed
        .iter()
        .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
        .collect();

    if let Err(e) = poll(&mut poll_fds, PollTimeout::from(timeout_ms)) {
        if e != nix::errno::Errno::EINTR {
            warn!("poll failed: {e}");
        }
    }
}

/// Serialize, then exec ourselves with `--deserialize=FD`. Unit-owned fds
/// survive the exec with their numbers intact: the serialization blob
/// records `fd=<number> <role>` per owner and close-on-exec is cleared on
/// each stored fd here. Returns only on failure.
fn reexecute(manager: &Manager) {
    use std::io::{Seek, Write};
    use std::os::unix::io::AsRawFd;

    info!("re-executing manager");

    manager.fd_store.prepare_inherit();
    let blob = manager.serialize_state();
    let mut file = match tempfile_in_run() {
        Ok(file) => file,
        Err(e) => {
            error!("cannot create serialization file: {e}");
            return;
        }
    };
    if let Err(e) = file.write_all(blob.as_bytes()).and_then(|()| file.rewind()) {
        error!("cannot write serialization: {e}");
        return;
    }

    // The fd must survive the exec.
    let fd = file.as_raw_fd();
    if let Err(e) = nix::fcntl::fcntl(
        unsafe { BorrowedFd::borrow_raw(fd) },
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()),
    ) {
        error!("cannot clear close-on-exec: {e}");
        return;
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            error!("cannot determine own executable: {e}");
            return;
        }
    };
    let err = exec_with_deserialize(&exe, fd);
    error!("re-execution failed: {err}");
}

fn tempfile_in_run() -> std::io::Result<std::fs::File> {
    use std::fs::OpenOptions;

    let path = std::env::temp_dir().join(format!("unitd-reexec-{}", std::process::id()));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    // The content travels via the inherited fd, not the name.
    let _ = std::fs::remove_file(&path);
    Ok(file)
}

fn exec_with_deserialize(exe: &std::path::Path, fd: i32) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    std::process::Command::new(exe)
        .arg(format!("--deserialize={fd}"))
        .exec()
}

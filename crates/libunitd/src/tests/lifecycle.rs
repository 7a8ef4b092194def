//! Unit lifecycle behaviors around the engine: conditions, timeouts,
//! failure handlers, bound units, triggers, oneshots, and snapshots.

use std::time::{Duration, Instant};

use crate::conditions::{Condition, ConditionKind};
use crate::jobs::{JobKind, JobMode, JobResult};
use crate::signal_handler::ChildTermination;
use crate::tests::world;
use crate::units::{ActiveState, DepKind, ServiceType, Specific, UnitIdKind};

#[test]
fn failed_condition_skips_the_start() {
    let mut w = world();
    let a = w.add_service("a.service");
    w.manager
        .registry
        .get_by_id_mut(&a)
        .unwrap()
        .conditions
        .push(Condition::new(
            ConditionKind::PathExists,
            "/nonexistent-Vn3k/x",
            false,
            false,
        ));

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert!(w.broker.borrow().spawned.is_empty());
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Skipped)]
    );
}

#[test]
fn condition_skip_does_not_fail_dependents() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.requires_after(&a, &b);
    w.manager
        .registry
        .get_by_id_mut(&b)
        .unwrap()
        .conditions
        .push(Condition::new(
            ConditionKind::PathExists,
            "/nonexistent-Vn3k/x",
            false,
            false,
        ));

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(
        w.job_removals(),
        vec![
            ("b.service".to_owned(), JobResult::Skipped),
            ("a.service".to_owned(), JobResult::Done),
        ]
    );
}

#[test]
fn job_timeout_escalates_and_reports() {
    let mut w = world();
    let a = w.add_service_of_type("a.service", ServiceType::Oneshot);
    w.manager
        .registry
        .get_by_id_mut(&a)
        .unwrap()
        .config
        .job_timeout = Some(Duration::from_millis(1));

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.active_state(&a), ActiveState::Activating);
    let pid = w.broker.borrow().spawned_pid_of("/bin/a").unwrap();

    w.manager.tick(Instant::now() + Duration::from_secs(5));

    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Timeout)]
    );
    assert!(w.broker.borrow().killed.contains(&(pid, libc::SIGKILL)));
    w.assert_invariants();
}

#[test]
fn on_failure_units_are_started() {
    let mut w = world();
    let a = w.add_service("a.service");
    let rescue = w.add_service("rescue.service");
    w.dep(&a, DepKind::OnFailure, &rescue);
    w.broker.borrow_mut().refuse.push("/bin/a".to_owned());

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&a), ActiveState::Failed);
    assert_eq!(w.active_state(&rescue), ActiveState::Active);
    w.assert_invariants();
}

#[test]
fn bound_units_follow_their_anchor_down() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    // B binds to A: when A goes down, B follows
    w.dep(&b, DepKind::BindsTo, &a);
    w.make_running(&a, 600);
    w.make_running(&b, 601);

    // A's process dies on its own
    w.manager.notify_child_exit(600, ChildTermination::Exit(0));

    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert_eq!(w.active_state(&b), ActiveState::Deactivating);
    w.manager.notify_child_exit(601, ChildTermination::Signal(libc::SIGTERM));
    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    w.assert_invariants();
}

#[test]
fn reload_propagates_to_dependents() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.dep(&a, DepKind::PropagatesReloadTo, &b);
    {
        let unit = w.manager.registry.get_by_id_mut(&a).unwrap();
        if let Specific::Service(s) = &mut unit.specific {
            s.conf.exec_reload = Some(crate::units::Commandline {
                cmd: "/bin/reload-a".to_owned(),
                args: Vec::new(),
            });
        }
        let unit = w.manager.registry.get_by_id_mut(&b).unwrap();
        if let Specific::Service(s) = &mut unit.specific {
            s.conf.exec_reload = Some(crate::units::Commandline {
                cmd: "/bin/reload-b".to_owned(),
                args: Vec::new(),
            });
        }
    }
    w.make_running(&a, 610);
    w.make_running(&b, 611);

    w.manager
        .enqueue_job(JobKind::Reload, "a.service", JobMode::Replace, false)
        .unwrap();

    // A's reload helper is running; finish it
    let reload_a = w.broker.borrow().spawned_pid_of("/bin/reload-a").unwrap();
    w.manager.notify_child_exit(reload_a, ChildTermination::Exit(0));
    assert_eq!(w.active_state(&a), ActiveState::Active);

    // the reload was propagated to B
    let reload_b = w.broker.borrow().spawned_pid_of("/bin/reload-b").unwrap();
    w.manager.notify_child_exit(reload_b, ChildTermination::Exit(0));
    assert_eq!(w.active_state(&b), ActiveState::Active);
    w.assert_invariants();
}

#[test]
fn oneshot_with_remain_after_exit_stays_active() {
    let mut w = world();
    let a = w.add_service_of_type("a.service", ServiceType::Oneshot);
    {
        let unit = w.manager.registry.get_by_id_mut(&a).unwrap();
        if let Specific::Service(s) = &mut unit.specific {
            s.conf.remain_after_exit = true;
        }
    }

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    let pid = w.broker.borrow().spawned_pid_of("/bin/a").unwrap();
    w.manager.notify_child_exit(pid, ChildTermination::Exit(0));

    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(
        w.manager.registry.get_by_id(&a).unwrap().sub_state(),
        "exited"
    );
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Done)]
    );
}

#[test]
fn oneshot_completion_finishes_the_job() {
    let mut w = world();
    let a = w.add_service_of_type("a.service", ServiceType::Oneshot);

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    let pid = w.broker.borrow().spawned_pid_of("/bin/a").unwrap();
    w.manager.notify_child_exit(pid, ChildTermination::Exit(0));

    // without RemainAfterExit the unit settles at inactive, successfully
    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Done)]
    );
}

#[test]
fn socket_start_opens_listen_fds_into_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("web.socket-path");

    let mut w = world();
    let socket = w.add_socket(
        "web.socket",
        vec![crate::units::ListenSpec::Stream(
            sock_path.to_string_lossy().into_owned(),
        )],
    );

    w.manager
        .enqueue_job(JobKind::Start, "web.socket", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&socket), ActiveState::Active);
    assert_eq!(w.manager.fd_store.listen_fds_of(&socket).len(), 1);
    assert!(sock_path.exists());

    w.manager
        .enqueue_job(JobKind::Stop, "web.socket", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&socket), ActiveState::Inactive);
    assert!(w.manager.fd_store.listen_fds_of(&socket).is_empty());
    assert!(!sock_path.exists());
    w.assert_invariants();
}

#[test]
fn socket_open_failure_fails_the_start_job() {
    let mut w = world();
    let socket = w.add_socket(
        "bad.socket",
        vec![crate::units::ListenSpec::Stream(
            "/nonexistent-Vn3k/bad.socket-path".to_owned(),
        )],
    );

    w.manager
        .enqueue_job(JobKind::Start, "bad.socket", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&socket), ActiveState::Failed);
    assert!(w.manager.fd_store.listen_fds_of(&socket).is_empty());
    assert_eq!(
        w.job_removals(),
        vec![("bad.socket".to_owned(), JobResult::Failed)]
    );
}

#[test]
fn activated_service_inherits_the_listen_fds() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("web.socket-path");

    let mut w = world();
    let socket = w.add_socket(
        "web.socket",
        vec![crate::units::ListenSpec::Stream(
            sock_path.to_string_lossy().into_owned(),
        )],
    );
    let service = w.add_service("web.service");
    w.dep(&socket, DepKind::Triggers, &service);
    {
        let unit = w.manager.registry.get_by_id_mut(&service).unwrap();
        if let Specific::Service(s) = &mut unit.specific {
            s.conf.sockets.push(socket.clone());
        }
    }

    w.manager
        .enqueue_job(JobKind::Start, "web.socket", JobMode::Replace, false)
        .unwrap();
    let stored = w.manager.fd_store.listen_fds_of(&socket);
    assert_eq!(stored.len(), 1);

    w.manager.fire_trigger(&socket);
    assert_eq!(w.active_state(&service), ActiveState::Active);

    // ownership of the listen fd transferred to the child on spawn
    let pid = w.broker.borrow().spawned_pid_of("/bin/web").unwrap();
    assert_eq!(w.broker.borrow().inherited_fds_of(pid), stored);

    // cleanup so the tempdir can unlink the node
    w.manager
        .enqueue_job(JobKind::Stop, "web.socket", JobMode::Replace, false)
        .unwrap();
}

#[test]
fn socket_trigger_starts_service_and_rearms() {
    let mut w = world();
    let service = w.add_service("web.service");
    let socket = {
        let id = crate::tests::id("web.socket");
        let mut unit = crate::units::Unit::stub(id.clone());
        unit.load_state = crate::units::LoadState::Loaded;
        w.manager.registry.insert(unit).unwrap();
        id
    };
    w.dep(&socket, DepKind::Triggers, &service);

    w.manager
        .enqueue_job(JobKind::Start, "web.socket", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.active_state(&socket), ActiveState::Active);
    assert_eq!(
        w.manager.registry.get_by_id(&socket).unwrap().sub_state(),
        "listening"
    );

    // a connection arrives
    w.manager.fire_trigger(&socket);
    assert_eq!(w.active_state(&service), ActiveState::Active);
    assert_eq!(
        w.manager.registry.get_by_id(&socket).unwrap().sub_state(),
        "running"
    );

    // the service dies; the socket goes back to listening
    let pid = w.broker.borrow().spawned_pid_of("/bin/web").unwrap();
    w.manager.notify_child_exit(pid, ChildTermination::Exit(0));
    assert_eq!(
        w.manager.registry.get_by_id(&socket).unwrap().sub_state(),
        "listening"
    );
    w.assert_invariants();
}

#[test]
fn timer_elapse_fires_its_unit() {
    let mut w = world();
    let service = w.add_service("task.service");
    let timer = {
        let id = crate::tests::id("task.timer");
        let mut unit = crate::units::Unit::stub(id.clone());
        unit.load_state = crate::units::LoadState::Loaded;
        if let Specific::Timer(t) = &mut unit.specific {
            t.conf.on_boot = Some(Duration::from_millis(1));
        }
        w.manager.registry.insert(unit).unwrap();
        id
    };
    w.dep(&timer, DepKind::Triggers, &service);

    w.manager
        .enqueue_job(JobKind::Start, "task.timer", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.active_state(&timer), ActiveState::Active);
    assert_eq!(w.active_state(&service), ActiveState::Inactive);

    w.manager.tick(Instant::now() + Duration::from_secs(1));
    assert_eq!(w.active_state(&service), ActiveState::Active);
    w.assert_invariants();
}

#[test]
fn device_events_drive_device_units() {
    let mut w = world();

    w.manager.device_event("/sys/devices/virtual/block/loop0", true);
    let id = crate::tests::id(&crate::unit_name::name_from_path(
        "/sys/devices/virtual/block/loop0",
        ".device",
    ));
    assert_eq!(w.active_state(&id), ActiveState::Active);
    assert_eq!(w.manager.registry.get_by_id(&id).unwrap().sub_state(), "plugged");

    w.manager.device_event("/sys/devices/virtual/block/loop0", false);
    assert_eq!(w.active_state(&id), ActiveState::Inactive);
}

#[test]
fn snapshot_records_and_cleans_up() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.make_running(&a, 620);
    // b stays inactive and must not be part of the snapshot
    let _ = b;

    let snap = w.manager.create_snapshot(Some("before-upgrade"), true).unwrap();
    assert_eq!(snap.kind, UnitIdKind::Snapshot);
    {
        let unit = w.manager.registry.get_by_id(&snap).unwrap();
        assert!(unit.dependencies.contains(DepKind::Wants, &a));
        assert!(unit.dependencies.contains(DepKind::After, &a));
        assert!(!unit.dependencies.contains(DepKind::Wants, &b));
        assert!(unit.config.allow_isolate);
    }
    w.assert_invariants();

    // activating a cleanup snapshot consumes it
    w.manager
        .enqueue_job(JobKind::Start, &snap.name.clone(), JobMode::Replace, false)
        .unwrap();
    assert!(w.manager.registry.get_by_id(&snap).is_none());
    w.assert_invariants();
}

#[test]
fn snapshot_names_are_unique() {
    let mut w = world();
    w.manager.create_snapshot(Some("x"), false).unwrap();
    assert!(w.manager.create_snapshot(Some("x"), false).is_err());

    let first = w.manager.create_snapshot(None, false).unwrap();
    let second = w.manager.create_snapshot(None, false).unwrap();
    assert_ne!(first, second);
}

#[test]
fn clear_jobs_cancels_everything() {
    let mut w = world();
    let a = w.add_service_of_type("a.service", ServiceType::Oneshot);
    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.manager.jobs.len(), 1);
    w.clear_events();

    w.manager.clear_jobs();

    assert!(w.manager.jobs.is_empty());
    assert_eq!(w.manager.registry.get_by_id(&a).unwrap().job, None);
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Cancelled)]
    );
}

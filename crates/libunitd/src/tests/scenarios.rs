//! The transaction and run-queue scenarios: ordering, conflicts, cycles,
//! failure propagation, isolation, and idempotence.

use crate::jobs::{JobKind, JobMode, JobResult, TransactionError};
use crate::signal_handler::ChildTermination;
use crate::tests::{id, world};
use crate::units::{ActiveState, DepKind, LoadState, ServiceType, Unit};

#[test]
fn linear_chain_starts_in_dependency_order() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    let c = w.add_service("c.service");
    w.requires_after(&a, &b);
    w.requires_after(&b, &c);

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(w.active_state(&b), ActiveState::Active);
    assert_eq!(w.active_state(&c), ActiveState::Active);

    let mut news = w.job_news();
    news.sort();
    assert_eq!(news, vec!["a.service", "b.service", "c.service"]);

    // completion order follows the ordering edges: C, then B, then A
    assert_eq!(
        w.job_removals(),
        vec![
            ("c.service".to_owned(), JobResult::Done),
            ("b.service".to_owned(), JobResult::Done),
            ("a.service".to_owned(), JobResult::Done),
        ]
    );
    w.assert_invariants();
}

#[test]
fn conflicts_stop_the_victim_first() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.dep(&a, DepKind::Conflicts, &b);
    w.make_running(&b, 900);

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    // the stop of B is in flight (SIGTERM sent), A must still be waiting
    assert_eq!(w.active_state(&b), ActiveState::Deactivating);
    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert_eq!(w.broker.borrow().killed, vec![(900, libc::SIGTERM)]);

    w.manager.notify_child_exit(900, ChildTermination::Signal(libc::SIGTERM));

    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(
        w.job_removals(),
        vec![
            ("b.service".to_owned(), JobResult::Done),
            ("a.service".to_owned(), JobResult::Done),
        ]
    );
    w.assert_invariants();
}

#[test]
fn wants_cycle_is_broken_by_dropping_a_job() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.dep(&a, DepKind::Wants, &b);
    w.dep(&a, DepKind::After, &b);
    w.dep(&b, DepKind::After, &a);

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    // the Wants-pulled job for B was deleted to break the cycle
    assert_eq!(w.job_news(), vec!["a.service".to_owned()]);
    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    w.assert_invariants();
}

#[test]
fn requires_cycle_fails_without_side_effects() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.requires_after(&a, &b);
    w.requires_after(&b, &a);

    let err = w
        .manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap_err();
    assert!(matches!(err, TransactionError::OrderingCycle(_)));

    assert!(w.manager.jobs.is_empty());
    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    assert!(w.broker.borrow().spawned.is_empty());
    w.assert_invariants();
}

#[test]
fn required_dependency_failure_propagates() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.requires_after(&a, &b);
    w.broker.borrow_mut().refuse.push("/bin/b".to_owned());

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&b), ActiveState::Failed);
    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert_eq!(
        w.job_removals(),
        vec![
            ("b.service".to_owned(), JobResult::Failed),
            ("a.service".to_owned(), JobResult::Dependency),
        ]
    );
    // the start operation was never invoked on A
    assert!(w.broker.borrow().spawned_pid_of("/bin/a").is_none());
    w.assert_invariants();
}

#[test]
fn wants_failure_does_not_propagate() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.dep(&a, DepKind::Wants, &b);
    w.dep(&a, DepKind::After, &b);
    w.broker.borrow_mut().refuse.push("/bin/b".to_owned());

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&b), ActiveState::Failed);
    assert_eq!(w.active_state(&a), ActiveState::Active);
    w.assert_invariants();
}

#[test]
fn starting_a_masked_unit_fails_cleanly() {
    let mut w = world();
    let mut unit = Unit::stub(id("masked.service"));
    unit.load_state = LoadState::Masked;
    w.manager.registry.insert(unit).unwrap();

    let err = w
        .manager
        .enqueue_job(JobKind::Start, "masked.service", JobMode::Replace, false)
        .unwrap_err();
    assert!(matches!(err, TransactionError::Masked(_)));
    assert!(w.manager.jobs.is_empty());
    assert!(w.job_news().is_empty());
}

#[test]
fn repeating_a_transaction_changes_nothing() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.requires_after(&a, &b);

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    w.clear_events();

    let spawns_before = w.broker.borrow().spawned.len();
    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();

    // only the anchor gets a (immediately redundant) job; B was dropped
    assert_eq!(w.job_news(), vec!["a.service".to_owned()]);
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Done)]
    );
    assert_eq!(w.broker.borrow().spawned.len(), spawns_before);
    w.assert_invariants();
}

#[test]
fn verify_active_from_requisite() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.dep(&a, DepKind::Requisite, &b);
    w.dep(&a, DepKind::After, &b);

    // B inactive: requisite verification fails and A falls with it
    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    assert_eq!(
        w.job_removals(),
        vec![
            ("b.service".to_owned(), JobResult::Failed),
            ("a.service".to_owned(), JobResult::Dependency),
        ]
    );
    w.clear_events();

    // B active: verification succeeds, A starts, B is not restarted
    w.make_running(&b, 950);
    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert!(w.broker.borrow().spawned_pid_of("/bin/b").is_none());
    w.assert_invariants();
}

#[test]
fn fail_mode_aborts_on_live_conflict() {
    let mut w = world();
    let a = w.add_service_of_type("a.service", ServiceType::Oneshot);

    // a oneshot stays activating until its process exits, keeping the
    // start job alive
    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.active_state(&a), ActiveState::Activating);
    assert_eq!(w.manager.jobs.len(), 1);
    w.clear_events();

    let err = w
        .manager
        .enqueue_job(JobKind::Stop, "a.service", JobMode::Fail, false)
        .unwrap_err();
    assert!(matches!(err, TransactionError::JobConflict { .. }));
    // the live start job is untouched
    assert_eq!(w.manager.jobs.len(), 1);
    assert!(w.job_removals().is_empty());
    w.assert_invariants();
}

#[test]
fn replace_mode_displaces_the_live_job() {
    let mut w = world();
    let a = w.add_service_of_type("a.service", ServiceType::Oneshot);

    w.manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Replace, false)
        .unwrap();
    w.clear_events();

    w.manager
        .enqueue_job(JobKind::Stop, "a.service", JobMode::Replace, false)
        .unwrap();

    let removals = w.job_removals();
    assert_eq!(removals[0], ("a.service".to_owned(), JobResult::Cancelled));
    // the stop job proceeded: SIGTERM went to the oneshot's process
    let pid = w.broker.borrow().spawned_pid_of("/bin/a").unwrap();
    assert!(w.broker.borrow().killed.contains(&(pid, libc::SIGTERM)));
    assert_eq!(w.active_state(&a), ActiveState::Deactivating);
    w.assert_invariants();

    w.manager.notify_child_exit(pid, ChildTermination::Signal(libc::SIGTERM));
    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    w.assert_invariants();
}

#[test]
fn isolate_stops_everything_unreachable() {
    let mut w = world();
    let goal = w.add_target("goal.target");
    let kept = w.add_service("kept.service");
    let dropped = w.add_service("dropped.service");
    let opted_out = w.add_service("optout.service");
    w.dep(&goal, DepKind::Requires, &kept);
    w.dep(&goal, DepKind::After, &kept);
    w.manager
        .registry
        .get_by_id_mut(&goal)
        .unwrap()
        .config
        .allow_isolate = true;
    w.manager
        .registry
        .get_by_id_mut(&opted_out)
        .unwrap()
        .config
        .ignore_on_isolate = true;
    w.make_running(&dropped, 700);
    w.make_running(&opted_out, 701);

    w.manager
        .enqueue_job(JobKind::Start, "goal.target", JobMode::Isolate, false)
        .unwrap();

    w.manager.notify_child_exit(700, ChildTermination::Signal(libc::SIGTERM));

    assert_eq!(w.active_state(&goal), ActiveState::Active);
    assert_eq!(w.active_state(&kept), ActiveState::Active);
    assert_eq!(w.active_state(&dropped), ActiveState::Inactive);
    assert_eq!(w.active_state(&opted_out), ActiveState::Active);
    w.assert_invariants();
}

#[test]
fn isolate_forbidden_for_ordinary_units() {
    let mut w = world();
    w.add_service("a.service");

    let err = w
        .manager
        .enqueue_job(JobKind::Start, "a.service", JobMode::Isolate, false)
        .unwrap_err();
    assert!(matches!(err, TransactionError::IsolateForbidden(_)));
    assert!(w.manager.jobs.is_empty());
}

#[test]
fn ignore_dependencies_touches_only_the_anchor() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.requires_after(&a, &b);

    w.manager
        .enqueue_job(
            JobKind::Start,
            "a.service",
            JobMode::IgnoreDependencies,
            false,
        )
        .unwrap();

    assert_eq!(w.job_news(), vec!["a.service".to_owned()]);
    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    w.assert_invariants();
}

#[test]
fn ignore_dependencies_suppresses_stop_cascade() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    // B requires A, so stopping A would normally stop B too
    w.requires_after(&b, &a);
    w.make_running(&a, 800);
    w.make_running(&b, 801);

    w.manager
        .enqueue_job(
            JobKind::Stop,
            "a.service",
            JobMode::IgnoreDependencies,
            false,
        )
        .unwrap();
    w.manager.notify_child_exit(800, ChildTermination::Signal(libc::SIGTERM));

    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    // B kept running: the reverse cascade was suppressed
    assert_eq!(w.active_state(&b), ActiveState::Active);
    w.assert_invariants();
}

#[test]
fn stop_cascades_to_requiring_units() {
    let mut w = world();
    let a = w.add_service("a.service");
    let b = w.add_service("b.service");
    w.requires_after(&b, &a);
    w.make_running(&a, 810);
    w.make_running(&b, 811);

    w.manager
        .enqueue_job(JobKind::Stop, "a.service", JobMode::Replace, false)
        .unwrap();

    // ordering: B (After A) must stop before A does
    assert_eq!(w.active_state(&b), ActiveState::Deactivating);
    assert_eq!(w.active_state(&a), ActiveState::Active);

    w.manager.notify_child_exit(811, ChildTermination::Signal(libc::SIGTERM));
    assert_eq!(w.active_state(&a), ActiveState::Deactivating);
    w.manager.notify_child_exit(810, ChildTermination::Signal(libc::SIGTERM));

    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert_eq!(w.active_state(&b), ActiveState::Inactive);
    assert_eq!(
        w.job_removals(),
        vec![
            ("b.service".to_owned(), JobResult::Done),
            ("a.service".to_owned(), JobResult::Done),
        ]
    );
    w.assert_invariants();
}

#[test]
fn restart_stops_then_starts() {
    let mut w = world();
    let a = w.add_service("a.service");
    w.make_running(&a, 820);

    w.manager
        .enqueue_job(JobKind::Restart, "a.service", JobMode::Replace, false)
        .unwrap();
    assert_eq!(w.active_state(&a), ActiveState::Deactivating);

    w.manager.notify_child_exit(820, ChildTermination::Signal(libc::SIGTERM));

    assert_eq!(w.active_state(&a), ActiveState::Active);
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Done)]
    );
    // a fresh process was spawned after the old one died
    assert!(w.broker.borrow().spawned_pid_of("/bin/a").is_some());
    w.assert_invariants();
}

#[test]
fn try_restart_skips_inactive_units() {
    let mut w = world();
    let a = w.add_service("a.service");

    w.manager
        .enqueue_job(JobKind::TryRestart, "a.service", JobMode::Replace, false)
        .unwrap();

    assert_eq!(w.active_state(&a), ActiveState::Inactive);
    assert!(w.broker.borrow().spawned.is_empty());
    assert_eq!(
        w.job_removals(),
        vec![("a.service".to_owned(), JobResult::Done)]
    );
}

//! Subscription lifecycle, including the thread-exit hook.

use std::thread;

use lockstep_governor::{Governor, GovernorConfig, GovernorError, RunMode};

fn random_config(dir: &tempfile::TempDir) -> GovernorConfig {
    GovernorConfig {
        mode: RunMode::Random,
        log_path: dir.path().join("gov.data"),
        seed: 11,
        pin_cpu: false,
    }
}

#[test]
fn exiting_thread_is_unsubscribed_automatically() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let governor = Governor::new(random_config(&dir)).unwrap();

    governor.prepare(1).unwrap();
    let peer = governor.clone();
    thread::spawn(move || {
        peer.subscribe(9).unwrap();
        peer.control_point().unwrap();
        // Exits without unsubscribing.
    })
    .join()
    .unwrap();

    // The exit hook must have removed the thread: prepare requires an
    // empty registry, and the id is free for reuse.
    governor.prepare(1).unwrap();
    let peer = governor.clone();
    thread::spawn(move || {
        peer.subscribe(9).unwrap();
        peer.control_point().unwrap();
        peer.unsubscribe().unwrap();
    })
    .join()
    .unwrap();
}

#[test]
fn explicit_unsubscribe_disarms_the_exit_hook() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let governor = Governor::new(random_config(&dir)).unwrap();

    // A thread that unsubscribes and then exits must not disturb a
    // later subscriber reusing its id.
    governor.prepare(1).unwrap();
    let peer = governor.clone();
    thread::spawn(move || {
        peer.subscribe(4).unwrap();
        peer.control_point().unwrap();
        peer.unsubscribe().unwrap();
    })
    .join()
    .unwrap();

    governor.prepare(1).unwrap();
    governor.subscribe(4).unwrap();
    governor.control_point().unwrap();
    governor.unsubscribe().unwrap();
}

#[test]
fn hook_discovered_inconsistency_reaches_the_parked_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gov.data");

    // The first record schedules thread 2; the second names a thread
    // that never subscribed. Thread 2 exits without unsubscribing, so
    // the bad record is discovered from its exit hook, with thread 1
    // still parked.
    std::fs::write(&path, "2 2 0\n3 1 0\nEND\n").unwrap();

    let governor = Governor::new(GovernorConfig {
        mode: RunMode::Preset,
        log_path: path,
        seed: 0,
        pin_cpu: false,
    })
    .unwrap();

    governor.prepare(2).unwrap();
    let survivor = {
        let governor = governor.clone();
        thread::spawn(move || {
            governor.subscribe(1).unwrap();
            governor.control_point().unwrap_err()
        })
    };
    let exiter = {
        let governor = governor.clone();
        thread::spawn(move || {
            governor.subscribe(2).unwrap();
            governor.control_point().unwrap();
            // Exits without unsubscribing.
        })
    };
    exiter.join().unwrap();

    // The peer is released with the halt, and the halt still names the
    // record and field the exit hook tripped over.
    let err = survivor.join().unwrap();
    let GovernorError::Halted { reason } = err else {
        panic!("expected a halt, got {err}");
    };
    assert!(reason.contains("record 2"), "diagnostic lost the record: {reason}");
    assert!(reason.contains("thread id 3"), "diagnostic lost the id: {reason}");
}

#[test]
fn unsubscribe_unblocks_a_waiting_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let governor = Governor::new(random_config(&dir)).unwrap();

    governor.prepare(2).unwrap();
    let workers: Vec<_> = [1usize, 2]
        .into_iter()
        .map(|id| {
            let governor = governor.clone();
            thread::spawn(move || {
                governor.subscribe(id).unwrap();
                governor.control_point().unwrap();
                if id == 2 {
                    // Leaves while thread 1 may still be parked; the
                    // decision step in unsubscribe must hand over.
                    governor.unsubscribe().unwrap();
                } else {
                    governor.control_point().unwrap();
                    governor.unsubscribe().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

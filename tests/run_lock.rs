use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

use harvester::infra::{LockError, LockStatus, RunLock};

#[test]
fn only_one_of_many_contenders_wins() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.lock");
    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                RunLock::acquire(&path)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LockError::Held { .. })));

    assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Held(_)));
    drop(results);
    assert_eq!(RunLock::inspect(&path).unwrap(), LockStatus::Free);
}

#[test]
fn lock_is_reusable_after_release() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.lock");

    for _ in 0..3 {
        let handle = RunLock::acquire(&path).unwrap();
        assert_eq!(handle.owner_pid(), std::process::id());
        handle.release().unwrap();
    }
    assert!(!path.exists());
}

#[test]
fn lock_left_by_a_dead_process_is_taken_over() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.lock");
    std::fs::write(
        &path,
        r#"{"pid": 4000000000, "acquired_at": "2024-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Stale(Some(_))));
    let handle = RunLock::acquire(&path).unwrap();
    assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Held(ref r) if r.pid == std::process::id()));
    drop(handle);
}

#[test]
fn contenders_reclaiming_one_stale_lock_yield_one_winner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.lock");
    let contenders = 8;

    for _ in 0..10 {
        std::fs::write(
            &path,
            r#"{"pid": 4000000000, "acquired_at": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    RunLock::acquire(&path)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(err, LockError::Held { .. } | LockError::Contended { .. }),
                "unexpected error: {err}"
            );
        }

        drop(results);
        assert!(!path.exists());
    }
}

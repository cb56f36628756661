mod common;

use common::{open_faulty_repo, open_file_repo, open_memory_repo};
use prefstore_core::{PreferencesRepository, PreferencesValue, RepoError};
use rusqlite::Connection;
use std::thread;
use std::time::{Duration, Instant};
use tokio::time::timeout;

fn value(counter: u32) -> PreferencesValue {
    PreferencesValue::new(counter)
}

#[tokio::test]
async fn empty_store_loads_default() {
    let repo = open_memory_repo().await;
    assert_eq!(repo.load_once().await.unwrap(), PreferencesValue::DEFAULT);
}

#[tokio::test]
async fn save_then_load_returns_saved_value() {
    let repo = open_memory_repo().await;
    for counter in [1, 42, 0, u32::MAX] {
        repo.save(value(counter)).await.unwrap();
        assert_eq!(repo.load_once().await.unwrap(), value(counter));
    }
}

#[tokio::test]
async fn saved_value_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let repo = open_file_repo(dir.path()).await;
        repo.save(value(31)).await.unwrap();
    }

    let reopened = open_file_repo(dir.path()).await;
    assert_eq!(reopened.load_once().await.unwrap(), value(31));
    assert_eq!(reopened.latest(), value(31));
    assert_eq!(reopened.backend_kind(), "sqlite");
}

#[tokio::test]
async fn clear_is_idempotent_and_keeps_a_single_record() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_file_repo(dir.path()).await;
    repo.save(value(5)).await.unwrap();

    repo.clear().await.unwrap();
    repo.clear().await.unwrap();
    assert_eq!(repo.load_once().await.unwrap(), PreferencesValue::DEFAULT);

    let conn = Connection::open(dir.path().join("prefs.db")).unwrap();
    let (rows, counter): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(MAX(counter), -1) FROM preferences;",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(counter, 0);
}

#[tokio::test]
async fn transaction_returns_body_output_and_commits() {
    let repo = open_memory_repo().await;
    repo.save(value(9)).await.unwrap();

    let previous = repo
        .transaction(|ops| {
            let current = ops.load()?;
            ops.save(current.incremented()?)?;
            Ok(current.counter)
        })
        .await
        .unwrap();

    assert_eq!(previous, 9);
    assert_eq!(repo.load_once().await.unwrap(), value(10));
}

#[tokio::test]
async fn body_sees_its_own_uncommitted_writes() {
    let repo = open_memory_repo().await;

    let observed = repo
        .transaction(|ops| {
            ops.save(value(4))?;
            let after_save = ops.load()?;
            ops.clear()?;
            let after_clear = ops.load()?;
            Ok((after_save, after_clear))
        })
        .await
        .unwrap();

    assert_eq!(observed, (value(4), PreferencesValue::DEFAULT));
}

#[tokio::test]
async fn failing_body_after_save_rolls_back() {
    let repo = open_memory_repo().await;
    repo.save(value(7)).await.unwrap();

    let result = repo
        .transaction(|ops| {
            let next = ops.load()?.incremented()?;
            ops.save(next)?;
            Err::<(), _>(RepoError::body_failed("rejected by validation"))
        })
        .await;

    match result {
        Err(RepoError::BodyFailed(cause)) => {
            assert_eq!(cause.to_string(), "rejected by validation")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(repo.load_once().await.unwrap(), value(7));
}

#[tokio::test]
async fn failing_body_before_save_leaves_value_unchanged() {
    let repo = open_memory_repo().await;
    repo.save(value(7)).await.unwrap();

    let result = repo
        .transaction(|ops| {
            let _next = ops.load()?.incremented()?;
            Err::<(), _>(RepoError::body_failed("gave up before writing"))
        })
        .await;

    assert!(matches!(result, Err(RepoError::BodyFailed(_))));
    assert_eq!(repo.load_once().await.unwrap(), value(7));
}

#[tokio::test]
async fn panicking_body_rolls_back_and_writer_keeps_serving() {
    let repo = open_memory_repo().await;
    repo.save(value(2)).await.unwrap();

    let result = repo
        .transaction(|ops| -> Result<(), RepoError> {
            ops.save(value(50))?;
            panic!("body exploded");
        })
        .await;

    match result {
        Err(RepoError::BodyFailed(cause)) => assert!(cause.to_string().contains("body exploded")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(repo.load_once().await.unwrap(), value(2));

    repo.save(value(3)).await.unwrap();
    assert_eq!(repo.load_once().await.unwrap(), value(3));
}

#[tokio::test]
async fn counter_overflow_inside_body_is_a_value_error() {
    let repo = open_memory_repo().await;
    repo.save(value(u32::MAX)).await.unwrap();

    let result = repo
        .transaction(|ops| {
            let next = ops.load()?.incremented()?;
            ops.save(next)
        })
        .await;

    assert!(matches!(result, Err(RepoError::Value(_))));
    assert_eq!(repo.load_once().await.unwrap(), value(u32::MAX));
}

#[tokio::test]
async fn nested_transaction_is_rejected_without_writing() {
    let repo = open_memory_repo().await;
    repo.save(value(4)).await.unwrap();

    let inner = repo.clone();
    let result = repo
        .transaction(move |ops| {
            ops.load()?;
            futures::executor::block_on(inner.transaction(|ops| ops.save(value(99))))
        })
        .await;

    assert!(matches!(result, Err(RepoError::NestedTransaction)));
    assert_eq!(repo.load_once().await.unwrap(), value(4));
}

#[tokio::test]
async fn outer_calls_from_inside_a_body_are_rejected() {
    let repo = open_memory_repo().await;

    let inner = repo.clone();
    let outcomes = repo
        .transaction(move |_ops| {
            let save = futures::executor::block_on(inner.save(value(8)));
            let clear = futures::executor::block_on(inner.clear());
            let read = futures::executor::block_on(inner.load_once());
            Ok((save.err(), clear.err(), read.err()))
        })
        .await
        .unwrap();

    assert!(matches!(outcomes.0, Some(RepoError::NestedTransaction)));
    assert!(matches!(outcomes.1, Some(RepoError::NestedTransaction)));
    assert!(matches!(outcomes.2, Some(RepoError::NestedTransaction)));
    assert_eq!(repo.load_once().await.unwrap(), PreferencesValue::DEFAULT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_delayed_increments_never_lose_updates() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_file_repo(dir.path()).await;
    repo.save(value(10)).await.unwrap();

    let increment = |repo: prefstore_core::ExclusiveRepository| async move {
        repo.transaction(|ops| {
            let current = ops.load()?;
            thread::sleep(Duration::from_millis(150));
            ops.save(current.incremented()?)?;
            Ok(current.counter)
        })
        .await
    };

    let (first, second) = tokio::join!(increment(repo.clone()), increment(repo.clone()));
    let mut observed = [first.unwrap(), second.unwrap()];
    observed.sort_unstable();

    assert_eq!(observed, [10, 11]);
    assert_eq!(repo.load_once().await.unwrap(), value(12));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_from_many_tasks_are_serialized() {
    let repo = open_memory_repo().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.transaction(|ops| {
                let next = ops.load()?.incremented()?;
                ops.save(next)
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(repo.load_once().await.unwrap(), value(8));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_caller_rolls_back_cooperative_body() {
    let repo = open_memory_repo().await;
    repo.save(value(3)).await.unwrap();

    let attempt = timeout(
        Duration::from_millis(80),
        repo.transaction(|ops| {
            ops.save(value(4))?;
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                ops.ensure_active()?;
                thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }),
    )
    .await;
    assert!(attempt.is_err(), "caller should have timed out");

    let started_at = Instant::now();
    let after = repo.transaction(|ops| ops.load()).await.unwrap();
    assert_eq!(after, value(3));
    assert!(started_at.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_caller_rolls_back_body_that_never_checks() {
    let repo = open_memory_repo().await;
    repo.save(value(3)).await.unwrap();

    let attempt = timeout(
        Duration::from_millis(50),
        repo.transaction(|ops| {
            ops.save(value(4))?;
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }),
    )
    .await;
    assert!(attempt.is_err());

    let after = repo.transaction(|ops| ops.load()).await.unwrap();
    assert_eq!(after, value(3));
}

#[tokio::test]
async fn commit_failure_reports_store_error_and_keeps_old_value() {
    let (repo, faults) = open_faulty_repo().await;
    repo.save(value(6)).await.unwrap();

    faults.fail_commits(true);
    let result = repo.save(value(7)).await;
    assert!(matches!(result, Err(RepoError::StoreUnavailable(_))));

    faults.fail_commits(false);
    assert_eq!(repo.load_once().await.unwrap(), value(6));
    repo.save(value(8)).await.unwrap();
    assert_eq!(repo.load_once().await.unwrap(), value(8));
}

#[tokio::test]
async fn read_failure_is_reported_by_load_once() {
    let (repo, faults) = open_faulty_repo().await;
    faults.fail_reads(true);

    let result = repo.load_once().await;
    assert!(matches!(result, Err(RepoError::StoreUnavailable(_))));

    faults.fail_reads(false);
    assert_eq!(repo.load_once().await.unwrap(), PreferencesValue::DEFAULT);
}

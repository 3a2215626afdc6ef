use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::Config;

use super::entry::MAX_HEADER_LEN;
use super::*;

fn config(root: &Path) -> Config {
    Config {
        lock_poll_interval: Duration::from_millis(5),
        ..Config::with_store_root(root)
    }
}

fn square() -> Producer {
    Producer::new(ProducerIdentity::new("square", "1").unwrap()).param("n")
}

async fn square_of(args: ArgumentSnapshot, calls: &AtomicUsize) -> anyhow::Result<u64> {
    calls.fetch_add(1, Ordering::SeqCst);
    let n: u64 = args.get("n")?;
    Ok(n * n)
}

async fn slow_square_of(args: ArgumentSnapshot, calls: &AtomicUsize) -> anyhow::Result<u64> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    square_of(args, calls).await
}

fn memo_error(err: &anyhow::Error) -> &CacheError {
    err.downcast_ref::<MemoError>()
        .expect("error raised by the memoizer")
        .kind()
}

#[tokio::test]
async fn test_memoized() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let result = memoizer
            .call(&square(), CallArgs::new().arg(&12), |args| square_of(args, &calls))
            .await
            .unwrap();
        assert_eq!(result, 144);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let result = memoizer
        .call(&square(), CallArgs::new().arg(&13), |args| square_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(result, 169);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let entries = memoizer.store().entries().unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_positional_and_keyword_share_entry() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    let positional = memoizer
        .call(&square(), CallArgs::new().arg(&7), |args| square_of(args, &calls))
        .await
        .unwrap();
    let keyword = memoizer
        .call(&square(), CallArgs::new().kwarg("n", &7), |args| {
            square_of(args, &calls)
        })
        .await
        .unwrap();

    assert_eq!(positional, keyword);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_persisted_across_memoizers() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let calls = AtomicUsize::new(0);

    let first = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    first
        .call(&square(), CallArgs::new().arg(&4), |args| square_of(args, &calls))
        .await
        .unwrap();
    drop(first);

    let second = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let result = second
        .call(&square(), CallArgs::new().arg(&4), |args| square_of(args, &calls))
        .await
        .unwrap();

    assert_eq!(result, 16);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[derive(Debug, thiserror::Error)]
enum ProducerError {
    #[error("the producer failed")]
    Failed,
    #[error(transparent)]
    Memo(#[from] MemoError),
}

#[tokio::test]
async fn test_producer_errors_are_not_cached() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let err = memoizer
            .call(&square(), CallArgs::new().arg(&3), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProducerError::Failed)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::Failed), "{err}");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(memoizer.store().entries().unwrap().is_empty());

    // the error did not poison the key
    let result = memoizer
        .call(&square(), CallArgs::new().arg(&3), |args| square_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(result, 9);
}

#[tokio::test]
async fn test_invalid_call() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    let err = memoizer
        .call(&square(), CallArgs::new().kwarg("m", &3), |args| {
            square_of(args, &calls)
        })
        .await
        .unwrap_err();
    assert!(matches!(memo_error(&err), CacheError::InvalidCall(_)), "{err}");
    assert_eq!(
        err.to_string(),
        "memoizing `square@1` with (m=3) failed: invalid call: `square@1` got an unexpected keyword argument `m`"
    );

    let err = memoizer
        .call(&square(), CallArgs::new().arg(&f64::NAN), |args| {
            square_of(args, &calls)
        })
        .await
        .unwrap_err();
    assert!(
        matches!(memo_error(&err), CacheError::UnrepresentableArgument { .. }),
        "{err}"
    );

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_compute_once() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);
    let producer = square();

    let tasks = (0..16).map(|_| {
        memoizer.call(&producer, CallArgs::new().arg(&9), |args| {
            slow_square_of(args, &calls)
        })
    });
    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap(), 81);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_memoizers_compute_once() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let calls = AtomicUsize::new(0);
    let producer = square();

    // every memoizer has its own in-process locks, only the file locks are shared
    let memoizers: Vec<_> = (0..4)
        .map(|_| Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap())
        .collect();

    let tasks = memoizers.iter().cycle().take(12).map(|memoizer| {
        memoizer.call(&producer, CallArgs::new().arg(&5), |args| {
            slow_square_of(args, &calls)
        })
    });
    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap(), 25);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

fn count_lines() -> Producer {
    Producer::new(ProducerIdentity::new("count_lines", "1").unwrap()).param("path")
}

async fn count_lines_of(args: ArgumentSnapshot, calls: &AtomicUsize) -> anyhow::Result<usize> {
    calls.fetch_add(1, Ordering::SeqCst);
    let path: PathBuf = args.get("path")?;
    Ok(fs::read_to_string(path)?.lines().count())
}

#[tokio::test]
async fn test_file_staleness() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let data = memostash_test::tempdir();
    let input = memostash_test::write_file(data.path(), "input.csv", b"a\nb\n");

    let memoizer = Memoizer::new(&config(root.path()), Json::<usize>::new())
        .unwrap()
        .with_decider(FileComparisonDecider::new("path"));
    let calls = AtomicUsize::new(0);
    let call = || CallArgs::new().arg(&input);

    let lines = memoizer
        .call(&count_lines(), call(), |args| count_lines_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(lines, 2);

    let lines = memoizer
        .call(&count_lines(), call(), |args| count_lines_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(lines, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    fs::write(&input, b"a\nb\nc\n").unwrap();
    memostash_test::touch(&input, Duration::from_secs(10));

    let lines = memoizer
        .call(&count_lines(), call(), |args| count_lines_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(lines, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // the recomputed entry replaced the stale one
    let entries = memoizer.store().entries().unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_unavailable_resource_is_not_stored() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let data = memostash_test::tempdir();
    let missing = data.path().join("missing.csv");

    let memoizer = Memoizer::new(&config(root.path()), Json::<usize>::new())
        .unwrap()
        .with_decider(FileComparisonDecider::new("path"));
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let result = memoizer
            .call(&count_lines(), CallArgs::new().arg(&missing), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(0)
            })
            .await
            .unwrap();
        assert_eq!(result, 0);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(memoizer.store().entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_unavailable_resource_forces_miss() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let data = memostash_test::tempdir();
    let input = memostash_test::write_file(data.path(), "input.csv", b"a\n");

    let memoizer = Memoizer::new(&config(root.path()), Json::<usize>::new())
        .unwrap()
        .with_decider(FileComparisonDecider::new("path"));
    let calls = AtomicUsize::new(0);

    let lines = memoizer
        .call(&count_lines(), CallArgs::new().arg(&input), |args| {
            count_lines_of(args, &calls)
        })
        .await
        .unwrap();
    assert_eq!(lines, 1);

    fs::remove_file(&input).unwrap();
    let result = memoizer
        .call(&count_lines(), CallArgs::new().arg(&input), |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(0)
        })
        .await
        .unwrap();
    assert_eq!(result, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_max_age() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let calls = AtomicUsize::new(0);

    let long_lived = Memoizer::new(&config(root.path()), Json::<u64>::new())
        .unwrap()
        .with_decider(MaxAgeDecider::new(Duration::from_secs(3600)));
    for _ in 0..2 {
        long_lived
            .call(&square(), CallArgs::new().arg(&2), |args| square_of(args, &calls))
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let expired = long_lived.with_decider(MaxAgeDecider::new(Duration::ZERO));
    for _ in 0..2 {
        expired
            .call(&square(), CallArgs::new().arg(&2), |args| square_of(args, &calls))
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_force_refresh() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let calls = AtomicUsize::new(0);

    let config = Config {
        force_refresh: true,
        ..config(root.path())
    };
    let memoizer = Memoizer::new(&config, Json::<u64>::new()).unwrap();
    for _ in 0..3 {
        memoizer
            .call(&square(), CallArgs::new().arg(&6), |args| square_of(args, &calls))
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // refreshed entries are still written and served to regular callers
    let memoizer = memoizer.with_force_refresh(false);
    let result = memoizer
        .call(&square(), CallArgs::new().arg(&6), |args| square_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(result, 36);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_corrupt_entry() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    memoizer
        .call(&square(), CallArgs::new().arg(&8), |args| square_of(args, &calls))
        .await
        .unwrap();

    let arguments = square().bind(CallArgs::new().arg(&8)).unwrap();
    let key = CacheKey::fingerprint(square().identity(), &arguments);
    let path = memoizer.store().entry_path(&key);
    fs::write(&path, b"definitely not an entry").unwrap();

    let err = memoizer
        .call(&square(), CallArgs::new().arg(&8), |args| square_of(args, &calls))
        .await
        .unwrap_err();
    assert!(
        matches!(memo_error(&err), CacheError::StoreCorruption { .. }),
        "{err}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // a valid envelope with an undecodable payload is just as corrupt
    let entry = CacheEntry::new(&key, &arguments, DeciderState::empty(), b"not json".to_vec());
    memoizer.store().write(&key, &entry).unwrap();
    let err = memoizer
        .call(&square(), CallArgs::new().arg(&8), |args| square_of(args, &calls))
        .await
        .unwrap_err();
    assert!(
        matches!(memo_error(&err), CacheError::StoreCorruption { .. }),
        "{err}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_uncache() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    for n in 0..3u64 {
        memoizer
            .call(&square(), CallArgs::new().arg(&n), |args| square_of(args, &calls))
            .await
            .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert!(memoizer.uncache(&square(), CallArgs::new().arg(&1)).await.unwrap());
    assert!(!memoizer.uncache(&square(), CallArgs::new().arg(&1)).await.unwrap());

    memoizer
        .call(&square(), CallArgs::new().arg(&1), |args| square_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let removed = memoizer.uncache_producer(square().identity()).await.unwrap();
    assert_eq!(removed, 3);
    assert!(memoizer.store().entries().unwrap().is_empty());

    memoizer
        .call(&square(), CallArgs::new().arg(&2), |args| square_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uncache_waits_for_computation() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<u64>::new()).unwrap();
    let producer = square();
    let calls = &AtomicUsize::new(0);

    memoizer
        .call(&producer, CallArgs::new().arg(&4), |args| square_of(args, calls))
        .await
        .unwrap();

    // the entry is recomputed while the producer gets uncached
    let refreshing = memoizer.clone().with_force_refresh(true);
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let refresh = refreshing.call(&producer, CallArgs::new().arg(&4), move |args| async move {
        started_tx.send(()).unwrap();
        release_rx.await.unwrap();
        square_of(args, calls).await
    });

    let uncache = async {
        started_rx.await.unwrap();
        let uncache = memoizer.uncache_producer(producer.identity());
        tokio::pin!(uncache);
        let early = tokio::time::timeout(Duration::from_millis(100), uncache.as_mut()).await;
        assert!(early.is_err(), "entry removed during its computation");
        release_tx.send(()).unwrap();
        uncache.await.unwrap()
    };

    let (refreshed, removed) = tokio::join!(refresh, uncache);
    assert_eq!(refreshed.unwrap(), 16);
    assert_eq!(removed, 1);
    // the recomputed entry was written first, and then removed
    assert!(memoizer.store().entries().unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_oversized_arguments_are_not_stored() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer = Memoizer::new(&config(root.path()), Json::<usize>::new()).unwrap();
    let producer = Producer::new(ProducerIdentity::new("measure", "1").unwrap()).param("text");
    let calls = &AtomicUsize::new(0);
    let text = "x".repeat(MAX_HEADER_LEN as usize + 1);

    let measure = move |args: ArgumentSnapshot| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, anyhow::Error>(args.get::<String>("text")?.len())
    };

    // every call computes, instead of failing on an entry that cannot be read back
    for expected_calls in 1..=2 {
        let result = memoizer
            .call(&producer, CallArgs::new().arg(&text), measure)
            .await
            .unwrap();
        assert_eq!(result, text.len());
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
    }
    assert!(memoizer.store().entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_lock_timeout() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let config = Config {
        lock_timeout: Some(Duration::from_millis(50)),
        ..config(root.path())
    };
    let memoizer = Memoizer::new(&config, Json::<u64>::new()).unwrap();
    let calls = AtomicUsize::new(0);

    // another process is busy computing the same key
    let arguments = square().bind(CallArgs::new().arg(&11)).unwrap();
    let key = CacheKey::fingerprint(square().identity(), &arguments);
    let other = LockManager::new(memoizer.store().locks_dir(), None, Duration::from_millis(5));
    let held = other.acquire(&key).await.unwrap();

    let err = memoizer
        .call(&square(), CallArgs::new().arg(&11), |args| square_of(args, &calls))
        .await
        .unwrap_err();
    assert!(matches!(memo_error(&err), CacheError::LockTimeout(_)), "{err}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    drop(held);
    let result = memoizer
        .call(&square(), CallArgs::new().arg(&11), |args| square_of(args, &calls))
        .await
        .unwrap();
    assert_eq!(result, 121);
}

#[tokio::test]
async fn test_unencodable_result() {
    memostash_test::setup();
    let root = memostash_test::tempdir();
    let memoizer =
        Memoizer::new(&config(root.path()), Json::<HashMap<(u32, u32), u32>>::new()).unwrap();
    let producer = Producer::new(ProducerIdentity::new("pairs", "1").unwrap());

    let err = memoizer
        .call(&producer, CallArgs::new(), |_| async {
            let mut pairs = HashMap::new();
            pairs.insert((1, 2), 3);
            Ok::<_, anyhow::Error>(pairs)
        })
        .await
        .unwrap_err();
    assert!(
        matches!(memo_error(&err), CacheError::PayloadEncoding(_)),
        "{err}"
    );
    assert!(memoizer.store().entries().unwrap().is_empty());
}

#[test]
fn test_namespace_unavailable() {
    let root = memostash_test::tempdir();
    let blocker = memostash_test::write_file(root.path(), "blocker", b"");

    let err = Memoizer::new(&config(&blocker.join("store")), RawBytes).unwrap_err();
    assert!(matches!(err, CacheError::NamespaceUnavailable { .. }), "{err}");
}

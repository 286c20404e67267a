#![cfg(feature = "shared-memory")]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::spawn;
use std::time::{Duration, Instant};

use proxmox_token_bucket::storage::{SHARED_KEY_MAX_LEN, SHARED_SLOTS};
use proxmox_token_bucket::{
    Error, ManualClock, MonotonicClock, Rate, SharedMemoryStorage, StorageError,
    TimestampStorage, TokenBucket, TokenBucketConfig,
};

fn test_path(filename: &str) -> Option<PathBuf> {
    let mut path = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
    path.push("token-bucket-shmem");
    let _ = std::fs::create_dir_all(&path);

    // check for O_TMPFILE support
    {
        use std::os::unix::fs::OpenOptionsExt;
        if std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_TMPFILE)
            .open(&path)
            .is_err()
        {
            return None;
        }
    }

    path.push(filename);
    let _ = std::fs::remove_file(&path);
    Some(path)
}

#[test]
fn test_separate_mappings_share_one_limit() -> Result<(), Error> {
    let path = match test_path("shared-limit.shm") {
        None => return Ok(()), // no O_TMPFILE support, can't run test
        Some(path) => path,
    };

    let clock = ManualClock::new(5_000_000.0);
    let config = TokenBucketConfig::new(10, Rate::from_refill_micros(1_000)?).initial_tokens(10);

    // two independent mappings, as two processes would have them
    let first = TokenBucket::with_storage(
        config,
        "datastore",
        SharedMemoryStorage::open(&path)?,
        clock.clone(),
    )?;
    let second = TokenBucket::with_storage(
        config,
        "datastore",
        SharedMemoryStorage::open(&path)?,
        clock.clone(),
    )?;

    first.consume(7)?;
    assert_eq!(second.available_tokens()?, 3);

    second.consume(3)?;
    assert_eq!(first.available_tokens()?, 0);

    clock.advance(Duration::from_micros(4_000));
    assert_eq!(first.available_tokens()?, 4);
    assert_eq!(second.available_tokens()?, 4);

    Ok(())
}

#[test]
fn test_keys_are_independent() -> Result<(), Error> {
    let path = match test_path("keys.shm") {
        None => return Ok(()),
        Some(path) => path,
    };

    let storage = SharedMemoryStorage::open(&path)?;
    assert!(storage.bootstrap("read", 1.0)?);
    assert!(storage.bootstrap("write", 2.0)?);
    assert!(!storage.bootstrap("read", 3.0)?);

    assert_eq!(storage.read_timestamp("read")?, 1.0);
    assert_eq!(storage.read_timestamp("write")?, 2.0);
    assert!(storage.compare_and_swap_timestamp("write", 2.0, 4.0)?);
    assert!(!storage.compare_and_swap_timestamp("write", 2.0, 5.0)?);
    assert_eq!(storage.read_timestamp("write")?, 4.0);

    assert!(matches!(
        storage.read_timestamp("unknown"),
        Err(StorageError::NotBootstrapped(_))
    ));
    assert!(matches!(
        storage.bootstrap(&"k".repeat(SHARED_KEY_MAX_LEN + 1), 1.0),
        Err(StorageError::InvalidKey { .. })
    ));

    Ok(())
}

#[test]
fn test_table_full() -> Result<(), Error> {
    let path = match test_path("full.shm") {
        None => return Ok(()),
        Some(path) => path,
    };

    let storage = SharedMemoryStorage::open(&path)?;
    for index in 0..SHARED_SLOTS {
        assert!(storage.bootstrap(&format!("key-{index}"), index as f64)?);
    }
    assert!(matches!(
        storage.bootstrap("one-too-many", 0.0),
        Err(StorageError::TableFull(_))
    ));
    // existing keys still work
    assert_eq!(storage.read_timestamp("key-17")?, 17.0);

    Ok(())
}

#[test]
fn test_concurrent_bootstrap_claims_one_slot() -> Result<(), Error> {
    let path = match test_path("bootstrap-race.shm") {
        None => return Ok(()),
        Some(path) => path,
    };
    let path = Arc::new(path);

    let threads: Vec<_> = (0..16)
        .map(|index| {
            let path = Arc::clone(&path);
            spawn(move || {
                let storage = SharedMemoryStorage::open(&path).unwrap();
                storage.bootstrap("contended", index as f64).unwrap()
            })
        })
        .collect();

    let winners = threads
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    // the key must not have been stored twice
    let storage = SharedMemoryStorage::open(&path)?;
    assert!(storage.bootstrap("second", 0.0)?);
    for index in 2..SHARED_SLOTS {
        assert!(storage.bootstrap(&format!("fill-{index}"), 0.0)?);
    }

    Ok(())
}

#[test]
fn test_separate_mappings_never_over_grant() -> Result<(), Error> {
    const CONSUMERS: usize = 4;
    const RATE: u64 = 1_000;
    const CAPACITY: u64 = 10;

    let path = match test_path("over-grant.shm") {
        None => return Ok(()),
        Some(path) => path,
    };
    let path = Arc::new(path);
    let granted = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(CONSUMERS + 1));
    let duration = Duration::from_millis(300);

    let threads: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let path = Arc::clone(&path);
            let granted = Arc::clone(&granted);
            let barrier = Arc::clone(&barrier);
            spawn(move || {
                // every thread maps the file on its own, like separate processes
                let config = TokenBucketConfig::new(CAPACITY, Rate::per_second(RATE).unwrap());
                let bucket = TokenBucket::with_storage(
                    config,
                    "contended",
                    SharedMemoryStorage::open(&path).unwrap(),
                    MonotonicClock,
                )
                .unwrap();

                barrier.wait();
                let start = Instant::now();
                while start.elapsed() < duration {
                    bucket.consume(1).unwrap();
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    barrier.wait();
    let start = Instant::now();
    for thread in threads {
        thread.join().unwrap();
    }
    let elapsed = start.elapsed();

    let granted = granted.load(Ordering::SeqCst);
    let allowed = (elapsed.as_secs_f64() * RATE as f64).ceil() as u64 + CAPACITY + 1;
    assert!(granted > 0);
    assert!(granted <= allowed, "granted {granted} tokens in {elapsed:?}");
    Ok(())
}

#[test]
fn test_corrupted_file_is_rejected() {
    let path = match test_path("corrupted.shm") {
        None => return,
        Some(path) => path,
    };

    std::fs::write(&path, vec![0xffu8; 4096]).unwrap();

    assert!(matches!(
        SharedMemoryStorage::open(&path),
        Err(StorageError::Unavailable(_))
    ));
}

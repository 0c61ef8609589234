//! Cross-process style races, simulated with independent cache handles on
//! one shared cache root.

use kiln_cache::{Cache, CacheEntry, CompressionMode, ExpectedFile, ExpectedFiles};
use kiln_config::Config;
use kiln_hash::DigestBuilder;
use kiln_pool::{IoWorker, PoolMode};
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn test_config(root: &Path) -> Config {
    Config {
        cache_dir: root.join("cache"),
        ..Config::default()
    }
}

#[test]
fn parallel_inserts_for_one_fingerprint_leave_exactly_one_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let tmp_path = Arc::new(tmp.path().to_path_buf());
    let config = test_config(&tmp_path);

    let mut digest_builder = DigestBuilder::new();
    digest_builder.update(b"contended fingerprint");
    let digest = digest_builder.finish();

    const WRITERS: usize = 16;
    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let config = config.clone();
        let tmp_path = Arc::clone(&tmp_path);
        handles.push(std::thread::spawn(move || {
            // Every "process" produces an equivalent artifact, as two
            // concurrent misses for the same fingerprint would.
            let artifact = tmp_path.join(format!("writer-{writer}.o"));
            fs::write(&artifact, b"equivalent object bytes").unwrap();

            let mut expected = ExpectedFiles::new();
            expected.insert("object".to_string(), ExpectedFile::new(&artifact, true));
            let entry = CacheEntry {
                file_ids: vec!["object".to_string()],
                compression_mode: CompressionMode::None,
                std_out: Vec::new(),
                std_err: Vec::new(),
                return_code: 0,
            };

            let cache =
                Cache::new(&config, IoWorker::disabled(), PoolMode::SingleThreaded).unwrap();
            cache.add(&digest, entry, &expected, false).unwrap();
            cache.flush();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = Cache::new(&config, IoWorker::disabled(), PoolMode::SingleThreaded).unwrap();
    assert_eq!(cache.local().entry_count().unwrap(), 1);

    // All losers discarded their staging areas.
    let tmp_dir = config.cache_dir.join("tmp");
    let leftovers: Vec<_> = fs::read_dir(&tmp_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(
        leftovers.is_empty(),
        "staging leftovers: {:?}",
        leftovers.iter().map(|e| e.file_name()).collect::<Vec<_>>()
    );

    // And the surviving entry replays correctly.
    let mut expected = ExpectedFiles::new();
    let target = tmp_path.join("replayed.o");
    expected.insert("object".to_string(), ExpectedFile::new(&target, true));
    let replay = cache
        .lookup(&digest, &expected, false, false)
        .unwrap()
        .expect("hit");
    assert_eq!(replay.return_code, 0);
    assert_eq!(fs::read(&target).unwrap(), b"equivalent object bytes");
}

#[test]
fn concurrent_readers_and_writers_do_not_corrupt_the_store() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let tmp_path = Arc::new(tmp.path().to_path_buf());

    const ROUNDS: usize = 24;
    let mut handles = Vec::new();
    for i in 0..4usize {
        let config = config.clone();
        let tmp_path = Arc::clone(&tmp_path);
        handles.push(std::thread::spawn(move || {
            let cache =
                Cache::new(&config, IoWorker::disabled(), PoolMode::SingleThreaded).unwrap();
            for round in 0..ROUNDS {
                let mut digest_builder = DigestBuilder::new();
                digest_builder.update(&[(round % 5) as u8]);
                let digest = digest_builder.finish();

                let artifact = tmp_path.join(format!("w{i}-r{round}.o"));
                fs::write(&artifact, [round as u8; 64]).unwrap();
                let mut expected = ExpectedFiles::new();
                expected.insert("object".to_string(), ExpectedFile::new(&artifact, true));

                if round % 2 == 0 {
                    let entry = CacheEntry {
                        file_ids: vec!["object".to_string()],
                        compression_mode: CompressionMode::None,
                        std_out: Vec::new(),
                        std_err: Vec::new(),
                        return_code: 0,
                    };
                    cache.add(&digest, entry, &expected, false).unwrap();
                } else {
                    // Lookups may hit or miss depending on interleaving;
                    // they must never error.
                    let target = tmp_path.join(format!("w{i}-r{round}-replay.o"));
                    let mut replay_expected = ExpectedFiles::new();
                    replay_expected
                        .insert("object".to_string(), ExpectedFile::new(&target, true));
                    cache
                        .lookup(&digest, &replay_expected, false, false)
                        .unwrap();
                }
            }
            cache.flush();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = Cache::new(&config, IoWorker::disabled(), PoolMode::SingleThreaded).unwrap();
    // Five distinct fingerprints were written.
    assert_eq!(cache.local().entry_count().unwrap(), 5);
}

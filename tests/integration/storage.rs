use crate::*;

use std::io::Write;

use dfs_core::config::StorageConfig;
use dfs_store::{cas_path_transform, CasStore, ShardLayout, StoreError};

#[test]
fn test_objects_survive_reopening_the_store() -> Result<()> {
    let scratch = Scratch::new("reopen");
    let hash = {
        let store = CasStore::new(&scratch.0, ShardLayout::DEFAULT)?;
        store.write_bytes(b"persistent")?.hash
    };

    let store = CasStore::new(&scratch.0, ShardLayout::DEFAULT)?;
    assert!(store.has(&hash));
    assert_eq!(store.read(&hash)?, b"persistent");
    assert_eq!(store.count(), 1);
    assert_eq!(store.size(), b"persistent".len() as u64);
    Ok(())
}

#[test]
fn test_write_stream_from_a_file_on_disk() -> Result<()> {
    let scratch = Scratch::new("file");
    std::fs::create_dir_all(&scratch.0)?;
    let source = scratch.0.join("input.bin");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::File::create(&source)?.write_all(&content)?;

    let store = CasStore::new(scratch.0.join("store"), ShardLayout::DEFAULT)?;
    let written = store.write_stream(std::fs::File::open(&source)?)?;

    let expected = cas_path_transform(std::fs::File::open(&source)?)?;
    assert_eq!(written, expected);
    assert_eq!(
        store.path_of(&written.hash)?,
        store.root().join(expected.file_path())
    );
    assert_eq!(store.read(&written.hash)?, content);
    Ok(())
}

#[test]
fn test_concurrent_writers_of_same_content() -> Result<()> {
    let scratch = Scratch::new("concurrent");
    let store = CasStore::new(&scratch.0, ShardLayout::DEFAULT)?;

    let hashes: Vec<String> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| s.spawn(|| store.write_bytes(b"same bytes").map(|p| p.hash)))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("writer panicked"))
            .collect::<Result<_, _>>()
    })?;

    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.count(), 1);
    assert_eq!(store.read(&hashes[0])?, b"same bytes");
    Ok(())
}

#[test]
fn test_store_from_config_uses_layout() -> Result<()> {
    let scratch = Scratch::new("config");
    let config = StorageConfig {
        root: scratch.0.clone(),
        shard_depth: 2,
        shard_width: 4,
    };
    let store = CasStore::from_config(&config)?;
    let path = store.write_bytes(b"configured")?;
    assert_eq!(path.dir.components().count(), 2);
    assert!(path
        .dir
        .components()
        .all(|c| c.as_os_str().len() == 4));
    Ok(())
}

#[test]
fn test_unknown_and_invalid_hashes() -> Result<()> {
    let scratch = Scratch::new("lookup");
    let store = CasStore::new(&scratch.0, ShardLayout::DEFAULT)?;

    let missing = "0".repeat(64);
    assert!(!store.has(&missing));
    assert!(matches!(store.read(&missing), Err(StoreError::NotFound(_))));
    assert!(matches!(
        store.read("../../etc/passwd"),
        Err(StoreError::InvalidHash(_))
    ));
    Ok(())
}

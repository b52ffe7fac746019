//! End-to-end scenarios through the full volume stack: journal, translation
//! layer, backend objects and read cache against a real (temp) cache device.

use bytes::Bytes;
use objbd_common::{Config, Error};
use objbd_core::Volume;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        cache_dir: dir.path().to_path_buf(),
        cache_size: 8 * 1024 * 1024,
        ..Config::default()
    }
}

/// Wait until the translation layer has committed everything to the backend
fn wait_backend_settled(vol: &Volume) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if vol.translate().frontier() == 0 && !vol.object_map().read().is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("backend never settled");
}

#[test]
fn fresh_volume_write_read_reopen() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();

    let vol = Volume::open("vol0", &cfg).unwrap();
    assert_eq!(vol.size(), 1 << 30);
    let data = vec![b'A'; 4096];
    vol.write(0, &data).unwrap();
    let mut buf = vec![0u8; 4096];
    vol.read(0, &mut buf).unwrap();
    assert_eq!(buf, data);
    vol.close().unwrap();

    let vol = Volume::open("vol0", &cfg).unwrap();
    let mut buf = vec![0u8; 4096];
    vol.read(0, &mut buf).unwrap();
    assert_eq!(buf, data);
    vol.close().unwrap();
}

#[test]
fn seventeen_blocks_flush_and_concatenated_read() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();
    let vol = Volume::open("vol0", &cfg).unwrap();

    for i in 0..17u64 {
        let block = vec![i as u8 + 1; 4096];
        vol.write(i * 4096, &block).unwrap();
    }
    let seq = vol.flush().unwrap();
    assert!(seq > 0);
    wait_backend_settled(&vol);

    let mut buf = vec![0u8; 17 * 4096];
    vol.read(0, &mut buf).unwrap();
    for i in 0..17usize {
        assert!(
            buf[i * 4096..(i + 1) * 4096].iter().all(|&b| b == i as u8 + 1),
            "block {} corrupted",
            i
        );
    }
    vol.close().unwrap();
}

#[test]
fn crash_recovery_replays_journal() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();

    let n_writes = {
        let vol = Volume::open("vol0", &cfg).unwrap();
        // Fill a good fraction of the ring, then "crash": drop the volume
        // without flushing or checkpointing.
        let ring = vol.write_cache().super_snapshot().ring_pages() as u64;
        let target = ring * 55 / 100;
        let mut written_pages = 0;
        let mut i = 0u64;
        while written_pages < target {
            vol.write(i * 16384, &vec![(i % 199) as u8 + 1; 16384]).unwrap();
            written_pages += 5; // 4 payload pages + header
            i += 1;
        }
        i
        // vol dropped here: threads stop, no flush, no final checkpoint
    };

    let vol = Volume::open("vol0", &cfg).unwrap();
    // Every acknowledged write is readable after recovery.
    let mut buf = vec![0u8; 16384];
    for i in 0..n_writes {
        vol.read(i * 16384, &mut buf).unwrap();
        assert!(
            buf.iter().all(|&b| b == (i % 199) as u8 + 1),
            "write {} lost in recovery",
            i
        );
    }
    // The post-recovery checkpoint pinned the durability frontier.
    let sb = vol.write_cache().super_snapshot();
    assert_eq!(vol.write_cache().next_acked_page(), sb.next);
    vol.close().unwrap();
}

#[test]
fn read_cache_eviction_keeps_data_readable() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();
    let vol = Volume::open("vol0", &cfg).unwrap();

    // Target data, committed to the backend.
    let total = 512 * 1024;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    for (i, chunk) in data.chunks(64 * 1024).enumerate() {
        vol.write(i as u64 * 64 * 1024, chunk).unwrap();
    }
    vol.flush().unwrap();
    wait_backend_settled(&vol);

    // Lap the journal ring with filler so eviction purges the target's
    // journal extents; reads of the target must now miss the journal.
    let ring = u64::from(vol.write_cache().super_snapshot().ring_pages());
    let filler_writes = ring * 2 / 9 + 2; // 9 pages per record (8 data + header)
    for i in 0..filler_writes {
        vol.write((1 << 24) + i * 32768, &vec![0xF1u8; 32768]).unwrap();
    }
    let (skip, hit, _) = vol.write_cache().read_lookup(0, total);
    assert_eq!((skip, hit), (total, 0), "journal still maps the target");

    // Cold reads populate the read cache.
    let mut buf = vec![0u8; total];
    vol.read(0, &mut buf).unwrap();
    assert_eq!(buf, data);
    assert!(vol.read_cache().free_lines() < vol.read_cache().units() as usize);

    // Evict everything and read again: lines are refetched correctly.
    let units = vol.read_cache().units() as usize;
    vol.read_cache().do_evict(units * 4);
    vol.read_cache().flush_metadata().unwrap();

    let mut buf2 = vec![0u8; total];
    vol.read(0, &mut buf2).unwrap();
    assert_eq!(buf2, data);
    vol.close().unwrap();
}

#[test]
fn concurrent_writer_reader_observe_monotonic_values() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();
    let vol = Arc::new(Volume::open("vol0", &cfg).unwrap());

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let vol = vol.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut last = 0u8;
            let mut buf = vec![0u8; 4096];
            while !stop.load(Ordering::Relaxed) {
                vol.read(0, &mut buf).unwrap();
                let stamp = buf[0];
                // No torn pages, and values never go backwards.
                assert!(buf.iter().all(|&b| b == stamp), "torn read");
                assert!(stamp >= last, "value went backwards: {} < {}", stamp, last);
                last = stamp;
            }
        })
    };

    for i in 1..=120u8 {
        vol.write(0, &vec![i; 4096]).unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    let mut buf = vec![0u8; 4096];
    vol.read(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 120));
    match Arc::try_unwrap(vol) {
        Ok(vol) => vol.close().unwrap(),
        Err(_) => panic!("volume still shared"),
    }
}

#[test]
fn missing_cache_device_surfaces_device_error() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();

    // Losing the local device between create and open is an I/O error, not
    // silent data loss.
    std::fs::remove_file(cfg.cache_path("vol0")).unwrap();
    assert!(matches!(Volume::open("vol0", &cfg), Err(Error::Device(_))));
}

#[test]
fn aio_write_then_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    Volume::create("vol0", 1 << 30, &cfg).unwrap();
    let vol = Volume::open("vol0", &cfg).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    vol.aio_write(
        8192,
        Bytes::from(vec![0x5Eu8; 8192]),
        Box::new(move |res| {
            tx.send(res).unwrap();
        }),
    );
    assert_eq!(rx.recv().unwrap().unwrap(), 8192);

    let (tx, rx) = std::sync::mpsc::channel();
    vol.aio_read(
        8192,
        8192,
        Box::new(move |res| {
            tx.send(res).unwrap();
        }),
    );
    let data = rx.recv().unwrap().unwrap();
    assert!(data.iter().all(|&b| b == 0x5E));
    vol.close().unwrap();
}

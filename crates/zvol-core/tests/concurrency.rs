//! Concurrent I/O, range locking and the deferred worker

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use zvol_core::memory::DeviceEvent;
use zvol_core::{
    BlockError, Dataset, IoOp, OpenMode, RangeLock, RangeMode, Request, ZvolConfig,
};

use common::{BLOCK_SIZE, Gate, Harness, VOL_SIZE, pattern};

#[test]
fn test_overlapping_readers_coexist() {
    let lock = RangeLock::new();
    let held = lock.acquire(0, 8192, RangeMode::Reader);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| {
            let guard = lock.acquire(4096, 8192, RangeMode::Reader);
            tx.send(guard.offset()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4096);
    });

    assert!(lock.try_acquire(0, 512, RangeMode::Writer).is_none());
    drop(held);
    assert!(lock.try_acquire(0, 512, RangeMode::Writer).is_some());
}

#[test]
fn test_writer_waits_for_overlapping_reader() {
    let lock = RangeLock::new();
    let held = lock.acquire(0, 4096, RangeMode::Reader);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| {
            let _guard = lock.acquire(2048, 4096, RangeMode::Writer);
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    });
    assert_eq!(lock.held(), 0);
}

#[test]
fn test_concurrent_writers_never_interleave() {
    // Small transfers so each request spans many transactions
    let h = Harness::with_config(ZvolConfig::with_max_transfer(4096));
    h.volume("tank/v");
    const LEN: usize = 64 * 1024;

    let seed = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    seed.write(0, vec![0x11u8; LEN]).unwrap();

    thread::scope(|s| {
        for byte in [0x11u8, 0x22] {
            let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
            s.spawn(move || {
                for _ in 0..50 {
                    assert_eq!(vol.write(0, vec![byte; LEN]).unwrap(), LEN as u64);
                }
            });
        }

        let reader = h.manager.open("tank/v", OpenMode::read()).unwrap();
        s.spawn(move || {
            for _ in 0..100 {
                let data = reader.read(0, LEN as u64).unwrap();
                let first = data[0];
                assert!(first == 0x11 || first == 0x22);
                assert!(data.iter().all(|b| *b == first), "torn read");
            }
        });
    });

    let data = seed.read(0, LEN as u64).unwrap();
    assert!(data.iter().all(|b| *b == data[0]));
}

#[test]
fn test_disjoint_writers_run_in_parallel() {
    let h = Harness::new();
    h.volume("tank/v");

    thread::scope(|s| {
        for i in 0..8u8 {
            let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
            s.spawn(move || {
                let offset = u64::from(i) * 65536;
                for _ in 0..20 {
                    vol.write(offset, pattern(i, 65536)).unwrap();
                }
            });
        }
    });

    let vol = h.manager.open("tank/v", OpenMode::read()).unwrap();
    for i in 0..8u8 {
        let data = vol.read(u64::from(i) * 65536, 65536).unwrap();
        assert_eq!(data, pattern(i, 65536));
    }
}

#[test]
fn test_deferred_requests_complete_in_order() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let pending: Vec<_> = (0..100u8)
        .map(|i| vol.submit_deferred(Request::write(0, vec![i])).unwrap())
        .collect();
    let ids: Vec<u64> = pending.iter().map(|p| p.request_id()).collect();

    for p in pending {
        let completion = p.wait().unwrap();
        assert!(completion.is_ok());
        assert_eq!(completion.bytes_transferred, 1);
    }

    assert_eq!(vol.read(0, 1).unwrap()[0], 99);
    let delivered: Vec<u64> = h
        .devices
        .delivered()
        .into_iter()
        .filter(|(_, c)| c.op == IoOp::Write)
        .map(|(_, c)| c.request_id)
        .collect();
    assert_eq!(delivered, ids);
    assert_eq!(vol.stats().deferred_ops, 100);
}

#[test]
fn test_deferred_read_sees_earlier_deferred_write() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let write = vol
        .submit_deferred(Request::write(4096, pattern(3, 4096)))
        .unwrap();
    let read = vol.submit_deferred(Request::read(4096, 4096)).unwrap();

    assert!(write.wait().unwrap().is_ok());
    let completion = read.wait().unwrap();
    assert_eq!(completion.data.unwrap(), pattern(3, 4096));
}

#[test]
fn test_deferred_submission_from_many_threads() {
    let h = Harness::new();
    h.volume("tank/v");

    thread::scope(|s| {
        for i in 0..4u8 {
            let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
            s.spawn(move || {
                let offset = u64::from(i) * 4096;
                let pending: Vec<_> = (0..25)
                    .map(|_| {
                        vol.submit_deferred(Request::write(offset, pattern(i, 4096)))
                            .unwrap()
                    })
                    .collect();
                for p in pending {
                    assert!(p.wait().unwrap().is_ok());
                }
            });
        }
    });

    let vol = h.manager.open("tank/v", OpenMode::read()).unwrap();
    assert_eq!(vol.stats().deferred_ops, 100);
    for i in 0..4u8 {
        assert_eq!(vol.read(u64::from(i) * 4096, 4096).unwrap(), pattern(i, 4096));
    }
}

#[test]
fn test_destroy_drains_queued_requests() {
    let h = Harness::new();
    h.volume("tank/v");
    let zvol = h.manager.find("tank/v").unwrap();
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let pending: Vec<_> = (0..200u64)
        .map(|i| {
            vol.submit_deferred(Request::write(i * 512, vec![1u8; 512]))
                .unwrap()
        })
        .collect();
    drop(vol);
    h.manager.destroy_minor("tank/v").unwrap();

    // Every queued request got a completion; none was dropped. Requests
    // that ran after the last close find the volume not open.
    let mut seen_not_open = false;
    for p in pending {
        let completion = p.wait().unwrap();
        match completion.error {
            None => {
                assert!(!seen_not_open, "completions out of order");
                assert_eq!(completion.bytes_transferred, 512);
            }
            Some(BlockError::NotOpen(_)) => seen_not_open = true,
            Some(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(zvol.lifecycle(), zvol_core::Lifecycle::Retired);
    assert!(h.manager.find("tank/v").is_none());
}

#[test]
fn test_destroy_after_deferred_io_completes() {
    let h = Harness::new();
    h.volume("tank/v");
    let (provider, _) = h.devices.active_provider("tank/v").unwrap();
    {
        let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
        let pending: Vec<_> = (0..10u64)
            .map(|i| {
                vol.submit_deferred(Request::write(i * 4096, pattern(7, 4096)))
                    .unwrap()
            })
            .collect();
        for p in pending {
            assert!(p.wait().unwrap().is_ok());
        }
    }

    h.manager.destroy_minor("tank/v").unwrap();
    assert_eq!(h.devices.retire_count(provider), 1);

    // Re-created volume sees the data
    h.manager.create_minor("tank/v").unwrap();
    let vol = h.manager.open("tank/v", OpenMode::read()).unwrap();
    assert_eq!(vol.read(9 * 4096, 4096).unwrap(), pattern(7, 4096));
}

#[test]
fn test_shrink_behind_first_write_leaves_nothing_past_end() {
    let sync_gate = Gate::new();
    let h = Harness::gated(&sync_gate, &Gate::new());
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    let shrunk = VOL_SIZE / 2;
    let tail = VOL_SIZE - 4096;

    // The first write opens the log; stop it right after that.
    let (entered, release) = sync_gate.arm();
    thread::scope(|s| {
        let writer = s.spawn(|| vol.write(tail, vec![0xABu8; 4096]));
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        let resizer = s.spawn(|| h.manager.resize("tank/v", shrunk));
        thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();

        resizer.join().unwrap().unwrap();
        // Either ordering is fine as long as nothing survives past the end
        let _ = writer.join().unwrap();
    });

    assert_eq!(vol.size(), shrunk);
    assert!(ds.read(tail, 4096).unwrap().iter().all(|b| *b == 0));
    assert!(matches!(
        vol.write(tail, vec![1u8; 4096]),
        Err(BlockError::OutOfRange { .. })
    ));
}

#[test]
fn test_no_io_lands_past_end_after_shrink() {
    let h = Harness::new();
    let ds = h.volume("tank/v");
    let shrunk = VOL_SIZE / 4;
    let blocks = VOL_SIZE / 4096;
    let resized = AtomicBool::new(false);
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for t in 0..4u64 {
            let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
            let (resized, stop) = (&resized, &stop);
            s.spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Acquire) {
                    let offset = (i * 37 + t * 11) % blocks * 4096;
                    let after_resize = resized.load(Ordering::Acquire);
                    let result = if i % 3 == 0 {
                        vol.read(offset, 4096).map(|data| data.len() as u64)
                    } else {
                        vol.write(offset, vec![0xCDu8; 4096])
                    };
                    if offset < shrunk {
                        assert_eq!(result.unwrap(), 4096);
                    } else if after_resize {
                        assert!(
                            matches!(result, Err(BlockError::OutOfRange { .. })),
                            "request at {offset} succeeded after the shrink"
                        );
                    }
                    i += 1;
                }
            });
        }

        thread::sleep(Duration::from_millis(20));
        h.manager.resize("tank/v", shrunk).unwrap();
        resized.store(true, Ordering::Release);
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
    });

    let tail = ds.read(shrunk, VOL_SIZE - shrunk).unwrap();
    assert!(tail.iter().all(|b| *b == 0), "data left past the new end");
}

#[test]
fn test_create_does_not_stall_other_volumes() {
    let volmode_gate = Gate::new();
    let h = Harness::gated(&Gate::new(), &volmode_gate);
    h.volume("tank/a");
    h.pool.create_volume("tank/b", VOL_SIZE, BLOCK_SIZE).unwrap();

    let (entered, release) = volmode_gate.arm();
    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        let manager = &h.manager;
        let creator = s.spawn(move || manager.create_minor("tank/b"));
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        s.spawn(move || {
            let opened = manager.open("tank/a", OpenMode::read()).map(|vol| vol.size());
            tx.send(opened).unwrap();
        });
        let opened = rx.recv_timeout(Duration::from_secs(5));
        release.send(()).unwrap();

        assert_eq!(opened.expect("open stalled by create").unwrap(), VOL_SIZE);
        creator.join().unwrap().unwrap();
    });
    assert!(h.manager.find("tank/b").is_some());
}

#[test]
fn test_losing_create_race_tears_down_its_provider() {
    let volmode_gate = Gate::new();
    let h = Harness::gated(&Gate::new(), &volmode_gate);
    h.pool.create_volume("tank/v", VOL_SIZE, BLOCK_SIZE).unwrap();

    let (entered, release) = volmode_gate.arm();
    let winner = thread::scope(|s| {
        let slow = s.spawn(|| h.manager.create_minor("tank/v"));
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        let winner = h.manager.create_minor("tank/v").unwrap();
        release.send(()).unwrap();
        assert!(matches!(
            slow.join().unwrap(),
            Err(BlockError::VolumeExists(_))
        ));
        winner
    });

    assert!(Arc::ptr_eq(&h.manager.find("tank/v").unwrap(), &winner));
    let (active, _) = h.devices.active_provider("tank/v").unwrap();
    assert_eq!(winner.info().provider, Some(active));

    let events = h.devices.events();
    let announced = events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Announced { .. }))
        .count();
    let retired = events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Retired { .. }))
        .count();
    assert_eq!((announced, retired), (2, 1));
    assert_eq!(h.pool.dataset("tank/v").unwrap().owners(), 0);
}

//! Request dispatch through open volume handles

mod common;

use bytes::Bytes;
use rand::RngCore;
use zvol_core::{
    Attribute, BlockError, ErrorClass, IoOp, OpenMode, Request, SeekWhence, ZvolConfig,
};

use common::{BLOCK_SIZE, Harness, POOL_CAPACITY, VOL_SIZE, pattern};

#[test]
fn test_out_of_range_makes_no_store_call() {
    let h = Harness::new();
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    let before = ds.store_calls();

    for request in [
        Request::read(VOL_SIZE, 512),
        Request::write(VOL_SIZE, vec![1u8; 512]),
        Request::delete(VOL_SIZE + 4096, 4096),
    ] {
        let completion = vol.submit(request);
        assert!(matches!(
            completion.error,
            Some(BlockError::OutOfRange { offset, size }) if offset >= VOL_SIZE && size == VOL_SIZE
        ));
        assert_eq!(completion.bytes_transferred, 0);
    }
    assert_eq!(ds.store_calls(), before);
}

#[test]
fn test_zero_length_past_end_is_not_an_error() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read()).unwrap();
    let completion = vol.submit(Request::read(VOL_SIZE * 2, 0));
    assert!(completion.is_ok());
    assert_eq!(completion.bytes_transferred, 0);
}

#[test]
fn test_transfer_clamped_at_volume_end() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let completion = vol.submit(Request::write(VOL_SIZE - 1024, vec![7u8; 4096]));
    assert!(completion.is_ok());
    assert_eq!(completion.bytes_transferred, 1024);

    let data = vol.read(VOL_SIZE - 2048, 8192).unwrap();
    assert_eq!(data.len(), 2048);
    assert!(data[..1024].iter().all(|b| *b == 0));
    assert!(data[1024..].iter().all(|b| *b == 7));
}

#[test]
fn test_write_read_round_trip() {
    let h = Harness::with_config(ZvolConfig::with_max_transfer(8192));
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let mut random = vec![0u8; 40_000];
    rand::thread_rng().fill_bytes(&mut random);

    for (offset, data) in [
        (0u64, vec![0u8; 4096]),
        (4096, vec![0xFFu8; 4096]),
        (12_345, random),
    ] {
        let written = vol.write(offset, data.clone()).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(vol.read(offset, data.len() as u64).unwrap(), Bytes::from(data));
    }
}

#[test]
fn test_reads_are_idempotent() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(8192, pattern(3, 10_000)).unwrap();

    let first = vol.read(4096, 16_384).unwrap();
    let second = vol.read(4096, 16_384).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_large_request_is_split() {
    let h = Harness::with_config(ZvolConfig::with_max_transfer(4096));
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let before = ds.store_calls();
    vol.write(0, pattern(9, 5 * 4096)).unwrap();
    assert_eq!(ds.store_calls().tx_assigns - before.tx_assigns, 5);

    let before = ds.store_calls();
    vol.read(0, 5 * 4096).unwrap();
    assert_eq!(ds.store_calls().reads - before.reads, 5);
}

#[test]
fn test_delete_frees_range() {
    let h = Harness::new();
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(0, vec![5u8; 4 * 4096]).unwrap();
    assert_eq!(ds.allocated(), 4 * 4096);

    assert_eq!(vol.delete(4096, 2 * 4096).unwrap(), 2 * 4096);
    assert_eq!(ds.allocated(), 2 * 4096);
    let data = vol.read(0, 4 * 4096).unwrap();
    assert!(data[..4096].iter().all(|b| *b == 5));
    assert!(data[4096..3 * 4096].iter().all(|b| *b == 0));
    assert!(data[3 * 4096..].iter().all(|b| *b == 5));

    let log = h.log("tank/v");
    assert!(log.records().iter().any(|r| matches!(
        r,
        zvol_core::LogRecord::Truncate {
            offset: 4096,
            length: 8192
        }
    )));
}

#[test]
fn test_delete_with_unmap_disabled() {
    let config = ZvolConfig {
        unmap_enabled: false,
        ..ZvolConfig::default()
    };
    let h = Harness::with_config(config);
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(0, vec![5u8; 4096]).unwrap();

    let before = ds.store_calls();
    assert_eq!(vol.delete(0, 4096).unwrap(), 4096);
    assert_eq!(ds.store_calls(), before);
    assert!(vol.read(0, 4096).unwrap().iter().all(|b| *b == 5));
    assert_eq!(vol.query(Attribute::CanDelete).unwrap(), 0);
}

#[test]
fn test_checksum_failure_surfaces_as_io_error() {
    let h = Harness::new();
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(8192, vec![1u8; 4096]).unwrap();
    assert!(ds.corrupt(8192 + 17));

    let err = vol.read(8192, 4096).unwrap_err();
    assert!(matches!(err, BlockError::Io(_)));
    assert_eq!(err.class(), ErrorClass::Io);

    let err = vol.read_at(8192, 512).unwrap_err();
    assert!(matches!(err, BlockError::Io(_)));

    // Unaffected blocks still read
    assert!(vol.read(0, 4096).is_ok());
}

#[test]
fn test_tx_assign_failure_reports_partial_count() {
    let h = Harness::with_config(ZvolConfig::with_max_transfer(4096));
    let ds = h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    ds.fail_assigns(2, 1);
    let completion = vol.submit(Request::write(0, pattern(1, 4 * 4096)));
    assert_eq!(completion.bytes_transferred, 2 * 4096);
    let err = completion.error.unwrap();
    assert!(matches!(err, BlockError::TxAssign(_)));
    assert_eq!(err.class(), ErrorClass::Resource);

    let data = vol.read(0, 4 * 4096).unwrap();
    assert_eq!(&data[..2 * 4096], &pattern(1, 4 * 4096)[..2 * 4096]);
    assert!(data[2 * 4096..].iter().all(|b| *b == 0));

    // Resubmission succeeds
    assert_eq!(vol.write(0, pattern(1, 4 * 4096)).unwrap(), 4 * 4096);
}

#[test]
fn test_read_only_handle_rejects_mutation() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read()).unwrap();

    assert!(matches!(
        vol.write(0, vec![1u8; 512]),
        Err(BlockError::ReadOnly(_))
    ));
    assert!(matches!(vol.delete(0, 512), Err(BlockError::ReadOnly(_))));
    assert!(matches!(
        vol.write_at(0, vec![1u8; 512], false),
        Err(BlockError::ReadOnly(_))
    ));
    assert!(matches!(
        vol.submit_deferred(Request::write(0, vec![1u8; 512])),
        Err(BlockError::ReadOnly(_))
    ));
}

#[test]
fn test_flush_on_read_only_volume_touches_no_log() {
    let h = Harness::new();
    h.volume("tank/v");
    h.props.set("tank/v", "readonly", "on");
    let vol = h.manager.open("tank/v", OpenMode::read()).unwrap();

    vol.flush().unwrap();
    assert_eq!(h.log("tank/v").commit_count(), 0);
}

#[test]
fn test_attribute_queries() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(0, vec![1u8; 2 * 4096]).unwrap();

    assert_eq!(vol.query(Attribute::MediaSize).unwrap(), VOL_SIZE);
    assert_eq!(vol.query(Attribute::SectorSize).unwrap(), 512);
    assert_eq!(
        vol.query(Attribute::StripeSize).unwrap(),
        u64::from(BLOCK_SIZE)
    );
    assert_eq!(vol.query(Attribute::StripeOffset).unwrap(), 0);
    assert_eq!(vol.query_named("GEOM::candelete").unwrap(), 1);
    assert_eq!(vol.query_named("blocksused").unwrap(), 16);
    assert_eq!(vol.query_named("poolblocksused").unwrap(), 16);
    assert_eq!(
        vol.query_named("poolblocksavail").unwrap(),
        (POOL_CAPACITY - 8192) / 512
    );
    assert_eq!(
        vol.query_named("blocksavail").unwrap(),
        (POOL_CAPACITY - 8192) / 512
    );
    assert!(matches!(
        vol.query_named("GEOM::ident"),
        Err(BlockError::Unsupported(_))
    ));
}

#[test]
fn test_seek_data_and_hole() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(16_384, vec![1u8; 8192]).unwrap();

    assert_eq!(vol.seek(0, SeekWhence::Data).unwrap(), 16_384);
    assert_eq!(vol.seek(0, SeekWhence::Hole).unwrap(), 0);
    assert_eq!(vol.seek(16_384, SeekWhence::Hole).unwrap(), 24_576);
    assert!(vol.seek(24_576, SeekWhence::Data).is_err());
    assert!(matches!(
        vol.seek(VOL_SIZE, SeekWhence::Hole),
        Err(BlockError::OutOfRange { .. })
    ));
}

#[test]
fn test_byte_stream_path() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    assert_eq!(vol.write_at(100, pattern(4, 1000), false).unwrap(), 1000);
    assert_eq!(vol.read_at(100, 1000).unwrap(), Bytes::from(pattern(4, 1000)));

    // Clamped at the end; at the end is EOF; past the end is an error
    assert_eq!(vol.write_at(VOL_SIZE - 100, vec![2u8; 200], false).unwrap(), 100);
    assert!(vol.read_at(VOL_SIZE, 10).unwrap().is_empty());
    assert_eq!(vol.write_at(VOL_SIZE, vec![2u8; 10], false).unwrap(), 0);
    assert!(matches!(
        vol.read_at(VOL_SIZE + 1, 10),
        Err(BlockError::OutOfRange { .. })
    ));
}

#[test]
fn test_completions_delivered_to_provider() {
    let h = Harness::new();
    h.volume("tank/v");
    let (provider, _) = h.devices.active_provider("tank/v").unwrap();
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();

    let request = Request::write(0, vec![1u8; 512]);
    let id = request.id;
    vol.submit(request);
    let delivered = h.devices.delivered();
    let (to, completion) = delivered.last().unwrap();
    assert_eq!(*to, provider);
    assert_eq!(completion.request_id, id);
    assert_eq!(completion.op, IoOp::Write);
    assert_eq!(completion.bytes_transferred, 512);
}

#[test]
fn test_stats_track_operations() {
    let h = Harness::new();
    h.volume("tank/v");
    let vol = h.manager.open("tank/v", OpenMode::read_write()).unwrap();
    vol.write(0, vec![1u8; 4096]).unwrap();
    vol.read(0, 1024).unwrap();
    vol.delete(0, 4096).unwrap();
    vol.flush().unwrap();
    let _ = vol.read(VOL_SIZE, 1);

    let stats = vol.stats();
    assert_eq!(stats.write_ops, 1);
    assert_eq!(stats.write_bytes, 4096);
    assert_eq!(stats.read_ops, 2);
    assert_eq!(stats.read_bytes, 1024);
    assert_eq!(stats.delete_ops, 1);
    assert_eq!(stats.freed_bytes, 4096);
    assert_eq!(stats.flush_ops, 1);
    assert_eq!(stats.failed_ops, 1);
}

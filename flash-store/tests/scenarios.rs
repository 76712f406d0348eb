//! Scenario-level coverage for `SparseImageStore`'s read/write/flush
//! algorithm, mirroring the concrete walkthroughs in `SPEC_FULL.md` §8.

use std::sync::{Arc, Mutex};

use flash_store::{Error, ReadReply, SparseImageStore};

fn pending(store: &SparseImageStore) -> Vec<(u64, Vec<u8>)> {
    store
        .pending_segments()
        .into_iter()
        .map(|s| (s.base, s.bytes))
        .collect()
}

#[test]
fn scenario_erase_then_write_pattern_prunes() {
    let mut store = SparseImageStore::from_backing(vec![0xFFu8; 1 << 20], 256);

    store.fill(0xFF, 0, 1 << 20).unwrap();
    assert_eq!(pending(&store), vec![]);

    store.write(0x10000, &vec![0xAAu8; 0x8000]).unwrap();
    assert_eq!(pending(&store), vec![(0x10000, vec![0xAA; 0x8000])]);

    store.write(0x14000, &vec![0xFFu8; 0x1000]).unwrap();
    let segs = pending(&store);
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[0], (0x10000, vec![0xAA; 0x4000]));
    assert_eq!(segs[1], (0x15000, vec![0xAA; 0x3000]));
}

#[test]
fn scenario_random_order_single_byte_writes_merge() {
    let mut store = SparseImageStore::new(1 << 20, 256);
    let mut order: Vec<u64> = (0..0x80).collect();
    // Deterministic, non-sorted permutation; no RNG needed to demonstrate
    // order-independence.
    order.rotate_left(37);

    for k in order {
        store.write(0x10000 + k, &[k as u8]).unwrap();
    }

    let bytes = store.read_sync(0x10000, 0x80).unwrap();
    let expected: Vec<u8> = (0..0x80u64).map(|k| k as u8).collect();
    assert_eq!(bytes, expected);
    assert_eq!(pending(&store), vec![(0x10000, expected)]);
}

#[test]
fn scenario_sector_materialization() {
    let mut store = SparseImageStore::new(0x1000, 0x100)
        .with_read_callback(|addr: u64, len: u64| {
            let _ = addr;
            Ok(ReadReply::AtRequestedBase(vec![0xAAu8; len as usize]))
        });
    // Only the second sector is ever fetched into the read cache.
    store.ensure(0x100, 0x100).unwrap();

    store.write(0x100, &vec![0xFFu8; 0x100]).unwrap();
    assert_eq!(pending(&store), vec![(0x100, vec![0xFF; 0x100])]);

    store.write(0x000, &vec![0xFFu8; 0x300]).unwrap();
    assert_eq!(pending(&store), vec![(0x000, vec![0xFF; 0x300])]);

    store.write(0x100, &vec![0xAAu8; 0x100]).unwrap();
    let segs = pending(&store);
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[0], (0x000, vec![0xFF; 0x100]));
    assert_eq!(segs[1], (0x200, vec![0xFF; 0x100]));
}

#[test]
fn scenario_flush_ordering_is_ascending_by_address() {
    let mut store = SparseImageStore::new(1 << 16, 256);
    store.write(0x8000, &[1, 2, 3]).unwrap();
    store.write(0x1000, &[4, 5, 6]).unwrap();
    store.write(0x4000, &[7, 8, 9]).unwrap();

    let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let order_cb = order.clone();
    let mut store = store.with_write_callback(move |addr: u64, _bytes: &[u8]| {
        order_cb.lock().unwrap().push(addr);
        Ok(())
    });
    store.flush().unwrap();

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, vec![0x1000, 0x4000, 0x8000]);
}

#[test]
fn no_op_write_leaves_pending_list_empty() {
    let mut store = SparseImageStore::from_backing(vec![0x42u8; 4096], 256);
    store.write(0x100, &vec![0x42u8; 256]).unwrap();
    assert_eq!(pending(&store), vec![]);
}

#[test]
fn flush_empties_pending_and_preserves_effective_view() {
    let mut store = SparseImageStore::new(4096, 256);
    store.write(0x100, &[1, 2, 3, 4]).unwrap();
    let before = store.read_sync(0x100, 4).unwrap();

    let mut store = store.with_write_callback(|_addr: u64, _bytes: &[u8]| Ok(()));
    store.flush().unwrap();

    assert_eq!(pending(&store), vec![]);
    let after = store.read_sync(0x100, 4).unwrap();
    assert_eq!(before, after);
}

#[test]
fn flush_partial_failure_retains_unwritten_tail() {
    let mut store = SparseImageStore::new(1 << 16, 256);
    store.write(0x1000, &[1, 2, 3]).unwrap();
    store.write(0x2000, &[4, 5, 6]).unwrap();

    let mut store = store.with_write_callback(|addr: u64, _bytes: &[u8]| {
        if addr == 0x2000 {
            Err(Box::<dyn std::error::Error + Send + Sync>::from("device wedged"))
        } else {
            Ok(())
        }
    });
    let err = store.flush().unwrap_err();
    assert!(matches!(err, Error::CallbackFailure(_)));

    let remaining = pending(&store);
    assert_eq!(remaining, vec![(0x2000, vec![4, 5, 6])]);
}

#[test]
fn write_out_of_range_is_rejected() {
    let mut store = SparseImageStore::new(1024, 256);
    let err = store.write(1020, &[0u8; 16]).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { .. }));
}

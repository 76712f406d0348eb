use flash_kvs::{add_item, add_namespace, delete_item, find_item, parse, update_item, Error, KvsValue};
use flash_store::SparseImageStore;

const PARTITION_LEN: u64 = 16 * 1024;

fn fresh_partition() -> SparseImageStore {
    SparseImageStore::from_backing(vec![0xFFu8; PARTITION_LEN as usize], 4096)
}

#[test]
fn freshly_erased_partition_accepts_a_fixed_width_item() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "storage").unwrap();
    add_item(&mut store, 0, PARTITION_LEN, "storage", "count", KvsValue::U32(42)).unwrap();

    let pages = parse(&mut store, 0, PARTITION_LEN).unwrap();
    let items: Vec<_> = pages.iter().flat_map(|p| p.items.iter()).collect();
    assert_eq!(items.len(), 1);
    let item = items[0];
    assert_eq!(item.namespace, "storage");
    assert_eq!(item.key, "count");
    assert_eq!(item.value, KvsValue::U32(42));
    assert!(item.header_crc_valid);
    assert_eq!(item.data_crc_valid, None);

    let activated = pages.iter().find(|p| p.offset == 0).unwrap();
    assert!(activated.header_crc_valid);
}

#[test]
fn freshly_erased_partition_round_trips_a_short_string() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "cfg").unwrap();
    let location =
        add_item(&mut store, 0, PARTITION_LEN, "cfg", "name", KvsValue::String("abc".to_string())).unwrap();
    assert_eq!(location.span, 2);

    let pages = parse(&mut store, 0, PARTITION_LEN).unwrap();
    let item = pages
        .iter()
        .flat_map(|p| p.items.iter())
        .find(|i| i.key == "name")
        .unwrap();
    assert_eq!(item.namespace, "cfg");
    assert_eq!(item.value, KvsValue::String("abc".to_string()));
    assert!(item.header_crc_valid);
    assert_eq!(item.data_crc_valid, Some(true));
}

#[test]
fn blob_round_trips_across_multiple_slots() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "assets").unwrap();
    let payload: Vec<u8> = (0u8..50).collect();
    add_item(&mut store, 0, PARTITION_LEN, "assets", "icon", KvsValue::Blob(payload.clone())).unwrap();

    let pages = parse(&mut store, 0, PARTITION_LEN).unwrap();
    let item = pages
        .iter()
        .flat_map(|p| p.items.iter())
        .find(|i| i.key == "icon")
        .unwrap();
    assert_eq!(item.value, KvsValue::Blob(payload));
    assert_eq!(item.data_crc_valid, Some(true));
}

#[test]
fn delete_then_find_returns_none_and_slot_is_reusable() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "ns").unwrap();
    add_item(&mut store, 0, PARTITION_LEN, "ns", "k", KvsValue::U8(7)).unwrap();
    assert!(find_item(&mut store, 0, PARTITION_LEN, "ns", "k").unwrap().is_some());

    delete_item(&mut store, 0, PARTITION_LEN, "ns", "k").unwrap();
    assert!(find_item(&mut store, 0, PARTITION_LEN, "ns", "k").unwrap().is_none());

    // the freed slot (or another free one) must still accept a new item
    add_item(&mut store, 0, PARTITION_LEN, "ns", "k2", KvsValue::U8(9)).unwrap();
    let pages = parse(&mut store, 0, PARTITION_LEN).unwrap();
    let keys: Vec<_> = pages.iter().flat_map(|p| p.items.iter()).map(|i| i.key.as_str()).collect();
    assert!(keys.contains(&"k2"));
    assert!(!keys.contains(&"k"));
}

#[test]
fn update_item_replaces_the_value_in_place() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "ns").unwrap();
    add_item(&mut store, 0, PARTITION_LEN, "ns", "k", KvsValue::U32(1)).unwrap();
    update_item(&mut store, 0, PARTITION_LEN, "ns", "k", KvsValue::U32(2)).unwrap();

    let pages = parse(&mut store, 0, PARTITION_LEN).unwrap();
    let matching: Vec<_> = pages.iter().flat_map(|p| p.items.iter()).filter(|i| i.key == "k").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].value, KvsValue::U32(2));
}

#[test]
fn update_item_on_a_missing_key_behaves_like_add() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "ns").unwrap();
    update_item(&mut store, 0, PARTITION_LEN, "ns", "new", KvsValue::I16(-5)).unwrap();

    let found = find_item(&mut store, 0, PARTITION_LEN, "ns", "new").unwrap();
    assert!(found.is_some());
}

#[test]
fn duplicate_namespace_name_is_rejected() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "dup").unwrap();
    let err = add_namespace(&mut store, 0, PARTITION_LEN, "dup").unwrap_err();
    assert!(matches!(err, Error::Conflict(name) if name == "dup"));
}

#[test]
fn add_item_against_unknown_namespace_fails_not_found() {
    let mut store = fresh_partition();
    let err = add_item(&mut store, 0, PARTITION_LEN, "nope", "k", KvsValue::U8(1)).unwrap_err();
    assert!(matches!(err, Error::NotFound { namespace, .. } if namespace == "nope"));
}

#[test]
fn multiple_namespaces_and_items_coexist_after_reparse() {
    let mut store = fresh_partition();
    add_namespace(&mut store, 0, PARTITION_LEN, "a").unwrap();
    add_namespace(&mut store, 0, PARTITION_LEN, "b").unwrap();
    add_item(&mut store, 0, PARTITION_LEN, "a", "x", KvsValue::U16(10)).unwrap();
    add_item(&mut store, 0, PARTITION_LEN, "b", "x", KvsValue::U16(20)).unwrap();

    let pages = parse(&mut store, 0, PARTITION_LEN).unwrap();
    let items: Vec<_> = pages.iter().flat_map(|p| p.items.iter()).collect();
    let a_x = items.iter().find(|i| i.namespace == "a" && i.key == "x").unwrap();
    let b_x = items.iter().find(|i| i.namespace == "b" && i.key == "x").unwrap();
    assert_eq!(a_x.value, KvsValue::U16(10));
    assert_eq!(b_x.value, KvsValue::U16(20));
}

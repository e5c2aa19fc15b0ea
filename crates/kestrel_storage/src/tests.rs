//! Crate-level tests exercising the map, the page-operation engine and
//! the page store together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use kestrel_common::config::StoreConfig;
use kestrel_common::datum::Datum;

use crate::handler::HandlerPool;
use crate::map::BTreeMap;
use crate::page::{DatumType, PageKey};
use crate::page_op::SyncListener;

fn pool() -> Arc<HandlerPool> {
    HandlerPool::start(4, Duration::from_millis(10))
}

fn open_mem(name: &str) -> Arc<BTreeMap<Datum>> {
    BTreeMap::open(
        name,
        None,
        StoreConfig::in_memory(),
        Arc::new(DatumType),
        pool(),
        None,
    )
    .unwrap()
}

fn int(k: i64) -> Datum {
    Datum::Int(k)
}

fn text(s: &str) -> Datum {
    Datum::Text(s.into())
}

#[test]
fn test_sequential_insert_and_read() {
    let map = open_mem("seq");
    for k in 1..=1000 {
        map.put(int(k), text(&format!("v{k}"))).unwrap();
    }
    assert_eq!(map.size(), 1000);
    assert_eq!(map.first_key(), Some(int(1)));
    assert_eq!(map.last_key(), Some(int(1000)));
    assert_eq!(map.get(&int(500)), Some(text("v500")));
    assert_eq!(map.get(&int(1001)), None);
}

#[test]
fn test_neighbour_keys_between_stored_keys() {
    let map = open_mem("neighbours");
    // Even keys only, so odd probes fall between entries.
    for k in 1..=1000 {
        map.put(int(k * 2), text("v")).unwrap();
    }
    assert_eq!(map.floor_key(&int(1001)), Some(int(1000)));
    assert_eq!(map.ceiling_key(&int(1001)), Some(int(1002)));
    assert_eq!(map.floor_key(&int(1000)), Some(int(1000)));
    assert_eq!(map.ceiling_key(&int(1000)), Some(int(1000)));
    assert_eq!(map.lower_key(&int(1000)), Some(int(998)));
    assert_eq!(map.higher_key(&int(1000)), Some(int(1002)));
    // Falling off either end.
    assert_eq!(map.lower_key(&int(2)), None);
    assert_eq!(map.higher_key(&int(2000)), None);
    assert_eq!(map.floor_key(&int(1)), None);
    assert_eq!(map.ceiling_key(&int(2001)), None);
}

#[test]
fn test_put_get_remove_round_trip() {
    let map = open_mem("round");
    assert_eq!(map.put(int(42), text("a")).unwrap(), None);
    assert_eq!(map.get(&int(42)), Some(text("a")));
    assert_eq!(map.put(int(42), text("b")).unwrap(), Some(text("a")));
    assert_eq!(map.remove(int(42)).unwrap(), Some(text("b")));
    assert_eq!(map.get(&int(42)), None);
    assert_eq!(map.size(), 0);
    // Removing an absent key touches nothing.
    assert_eq!(map.remove(int(42)).unwrap(), None);
}

#[test]
fn test_put_if_absent_keeps_first_value() {
    let map = open_mem("pia");
    assert_eq!(map.put_if_absent(int(1), text("v1")).unwrap(), None);
    assert_eq!(
        map.put_if_absent(int(1), text("v2")).unwrap(),
        Some(text("v1"))
    );
    assert_eq!(map.get(&int(1)), Some(text("v1")));
}

#[test]
fn test_replace_compares_with_value_comparator() {
    let map = open_mem("replace");
    map.put(int(1), text("old")).unwrap();
    assert!(!map.replace(int(1), text("other"), text("new")).unwrap());
    assert_eq!(map.get(&int(1)), Some(text("old")));
    assert!(map.replace(int(1), text("old"), text("new")).unwrap());
    assert_eq!(map.get(&int(1)), Some(text("new")));
    // Absent key never matches.
    assert!(!map.replace(int(9), text("x"), text("y")).unwrap());
}

#[test]
fn test_append_reserves_increasing_keys() {
    let map = open_mem("append");
    let k1 = map.append(text("a")).unwrap();
    let k2 = map.append(text("b")).unwrap();
    assert_eq!(k1, int(1));
    assert_eq!(k2, int(2));
    assert_eq!(map.get(&k2), Some(text("b")));
    assert_eq!(map.last_key(), Some(int(2)));
}

#[test]
fn test_cursor_is_ordered_and_complete() {
    let map = open_mem("cursor");
    // Insert in a scrambled order to exercise splits everywhere.
    let mut keys: Vec<i64> = (1..=500).collect();
    keys.reverse();
    for k in keys {
        map.put(int(k), text(&format!("v{k}"))).unwrap();
    }
    let collected: Vec<_> = map.cursor(None, None).collect();
    assert_eq!(collected.len() as u64, map.size());
    for (i, (k, v)) in collected.iter().enumerate() {
        assert_eq!(*k, int(i as i64 + 1));
        assert_eq!(*v, text(&format!("v{}", i + 1)));
    }
}

#[test]
fn test_cursor_range_bounds_inclusive() {
    let map = open_mem("range");
    for k in 1..=100 {
        map.put(int(k), text("v")).unwrap();
    }
    let collected: Vec<_> = map.cursor(Some(int(10)), Some(int(20))).collect();
    assert_eq!(collected.len(), 11);
    assert_eq!(collected.first().map(|(k, _)| k.clone()), Some(int(10)));
    assert_eq!(collected.last().map(|(k, _)| k.clone()), Some(int(20)));
}

#[test]
fn test_cursor_weak_snapshot_stays_ascending() {
    let map = open_mem("snapshot");
    for k in (1..=400).step_by(2) {
        map.put(int(k), text("before")).unwrap();
    }
    let cursor = map.cursor(None, None);
    // Concurrent writes land while the cursor drains.
    for k in (2..=400).step_by(2) {
        map.put(int(k), text("after")).unwrap();
    }
    let mut last = None;
    let mut seen = 0usize;
    for (k, _) in cursor {
        if let Some(prev) = &last {
            assert!(k > *prev, "cursor must stay strictly ascending");
        }
        last = Some(k);
        seen += 1;
    }
    // Every pre-existing key is seen; late arrivals may or may not be.
    assert!(seen >= 200);
}

#[test]
fn test_concurrent_disjoint_writers_with_reader() {
    let map = open_mem("concurrent");
    let m1 = Arc::clone(&map);
    let m2 = Arc::clone(&map);
    let reader = Arc::clone(&map);
    std::thread::scope(|s| {
        s.spawn(move || {
            for k in 1..=500 {
                m1.put(int(k), text(&format!("v{k}"))).unwrap();
            }
        });
        s.spawn(move || {
            for k in 501..=1000 {
                m2.put(int(k), text(&format!("v{k}"))).unwrap();
            }
        });
        s.spawn(move || {
            for _ in 0..10 {
                let mut last = None;
                for (k, _) in reader.cursor(Some(int(1)), Some(int(1000))) {
                    if let Some(prev) = &last {
                        assert!(k > *prev);
                    }
                    last = Some(k);
                }
            }
        });
    });
    assert_eq!(map.size(), 1000);
    for k in 1..=1000 {
        assert_eq!(map.get(&int(k)), Some(text(&format!("v{k}"))), "key {k}");
    }
}

#[test]
fn test_async_put_and_get() {
    let map = open_mem("async");
    let listener: Arc<SyncListener<Option<Datum>>> = SyncListener::new();
    map.put_async(int(7), text("v7"), listener.handler());
    let result = listener.await_result();
    assert_eq!(result.into_result().unwrap(), Some(None));

    let listener: Arc<SyncListener<Datum>> = SyncListener::new();
    map.get_async(&int(7), listener.handler());
    assert_eq!(
        listener.await_result().into_result().unwrap(),
        Some(text("v7"))
    );
}

#[test]
fn test_write_checks() {
    let map = BTreeMap::open(
        "readonly",
        None,
        StoreConfig {
            read_only: true,
            in_memory: true,
            ..Default::default()
        },
        Arc::new(DatumType),
        pool(),
        None,
    )
    .unwrap();
    assert!(map.put(int(1), text("v")).is_err());

    let map = open_mem("nulls");
    assert!(map.put(int(1), Datum::Null).is_err());

    let map = open_mem("closed");
    map.close();
    assert!(map.put(int(1), text("v")).is_err());
    assert!(map.is_closed());
}

#[test]
fn test_clear_keeps_replica_hosts() {
    let map = open_mem("clear");
    map.root_page()
        .set_replication_host_ids(Some(vec!["n1".into(), "n2".into()]));
    for k in 1..=100 {
        map.put(int(k), text("v")).unwrap();
    }
    map.clear().unwrap();
    assert_eq!(map.size(), 0);
    assert_eq!(map.get(&int(1)), None);
    assert_eq!(
        map.root_page().replication_host_ids(),
        Some(vec!["n1".into(), "n2".into()])
    );
}

#[test]
fn test_save_and_reopen() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::default();
    {
        let map = BTreeMap::open(
            "durable",
            Some(dir.path()),
            config.clone(),
            Arc::new(DatumType),
            pool(),
            None,
        )
        .unwrap();
        for k in 1..=200 {
            map.put(int(k), text(&format!("v{k}"))).unwrap();
        }
        map.save().unwrap();
        map.close();
    }
    let map = BTreeMap::open(
        "durable",
        Some(dir.path()),
        config,
        Arc::new(DatumType),
        pool(),
        None,
    )
    .unwrap();
    assert_eq!(map.size(), 200);
    assert_eq!(map.get(&int(137)), Some(text("v137")));
    assert_eq!(map.first_key(), Some(int(1)));
    assert_eq!(map.last_key(), Some(int(200)));
}

#[test]
fn test_sharding_requires_replication_nodes() {
    let result = BTreeMap::<Datum>::open(
        "sharded-bad",
        None,
        StoreConfig {
            in_memory: true,
            sharding_mode: true,
            ..Default::default()
        },
        Arc::new(DatumType),
        pool(),
        Some("n1".into()),
    );
    assert!(result.is_err());
}

#[test]
fn test_sharding_root_local_vs_remote() {
    let config = StoreConfig {
        in_memory: true,
        sharding_mode: true,
        init_replication_nodes: "n1&n2&n3".into(),
        ..Default::default()
    };
    let local = BTreeMap::<Datum>::open(
        "sharded-local",
        None,
        config.clone(),
        Arc::new(DatumType),
        pool(),
        Some("n2".into()),
    )
    .unwrap();
    assert!(local.root_page().is_leaf());
    assert_eq!(
        local.root_page().replication_host_ids(),
        Some(vec!["n1".into(), "n2".into(), "n3".into()])
    );

    let remote = BTreeMap::<Datum>::open(
        "sharded-remote",
        None,
        config,
        Arc::new(DatumType),
        pool(),
        Some("n9".into()),
    )
    .unwrap();
    assert!(remote.root_page().is_remote());
}

#[test]
fn test_split_fires_listener_in_sharding_mode() {
    let map = BTreeMap::open(
        "split-event",
        None,
        StoreConfig {
            in_memory: true,
            sharding_mode: true,
            init_replication_nodes: "n1".into(),
            btree_fanout: 8,
            ..Default::default()
        },
        Arc::new(DatumType),
        pool(),
        Some("n1".into()),
    )
    .unwrap();
    let fired: Arc<Mutex<Vec<Datum>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    map.set_split_listener(Arc::new(move |split_key| {
        sink.lock().push(split_key);
    }));
    for k in 1..=32 {
        map.put(int(k), text("v")).unwrap();
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while fired.lock().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!fired.lock().is_empty(), "split listener should fire");
    for k in 1..=32 {
        assert_eq!(map.get(&int(k)), Some(text("v")));
    }
}

#[test]
fn test_node_to_page_key_map_covers_range() {
    let map = BTreeMap::open(
        "pagekeys",
        None,
        StoreConfig {
            in_memory: true,
            btree_fanout: 8,
            ..Default::default()
        },
        Arc::new(DatumType),
        pool(),
        None,
    )
    .unwrap();
    for k in 1..=100 {
        map.put(int(k), text(&format!("v{k}"))).unwrap();
    }
    let groups = map.node_to_page_key_map(Some(&int(1)), Some(&int(100)));
    let page_keys: Vec<PageKey> = groups.into_iter().flat_map(|(_, pks)| pks).collect();
    assert!(page_keys.len() > 1, "a split tree yields multiple page keys");

    // The enumerated-page cursor sees the same data as a full scan.
    let via_pages: Vec<_> = map
        .cursor_over_pages(page_keys, Some(int(1)), Some(int(100)))
        .collect();
    assert_eq!(via_pages.len(), 100);
    for (i, (k, _)) in via_pages.iter().enumerate() {
        assert_eq!(*k, int(i as i64 + 1));
    }
}

#[test]
fn test_leaf_image_round_trip_and_splice() {
    let src = open_mem("src");
    for k in 1..=10 {
        src.put(int(k), text(&format!("v{k}"))).unwrap();
    }
    let pk = PageKey::new(int(1), true);
    let image = src.serialize_leaf(&pk, false).unwrap();

    let dst = open_mem("dst");
    let page = dst.deserialize_leaf(&image).unwrap();
    assert_eq!(page.key_count(), 10);
    dst.add_leaf_page(None, page, true).unwrap();
    assert_eq!(dst.get(&int(7)), Some(text("v7")));

    // Metadata-only image decodes to a remote placeholder.
    src.root_page()
        .set_replication_host_ids(Some(vec!["n1".into()]));
    let meta = src.serialize_leaf(&pk, true).unwrap();
    let remote = dst.deserialize_leaf(&meta).unwrap();
    assert!(remote.is_remote());
    assert_eq!(remote.replication_host_ids(), Some(vec!["n1".into()]));
}

#[test]
fn test_add_and_remove_leaf_page_splice() {
    let map = open_mem("splice");
    for k in 1..=4 {
        map.put(int(k), text("left")).unwrap();
    }
    // Splice a shipped right-half leaf at separator 100.
    let incoming = crate::page::Page::leaf(
        vec![int(100), int(101)],
        vec![text("right"), text("right")],
    );
    map.add_leaf_page(Some(&PageKey::new(int(100), false)), incoming, true)
        .unwrap();
    assert!(map.root_page().is_node());
    assert_eq!(map.get(&int(101)), Some(text("right")));
    assert_eq!(map.get(&int(2)), Some(text("left")));

    // Drop the spliced leaf again; the parent collapses.
    map.remove_leaf_page(Some(&PageKey::new(int(100), false)))
        .unwrap();
    assert_eq!(map.get(&int(101)), None);
    assert_eq!(map.get(&int(2)), Some(text("left")));
}

#[test]
fn test_handler_affinity_serialises_same_leaf() {
    // Many threads hammering one key; the per-leaf latch plus handler
    // affinity must keep every write intact.
    let map = open_mem("hammer");
    map.put(int(1), text("0")).unwrap();
    let writes = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|s| {
        for t in 0..8 {
            let map = Arc::clone(&map);
            let writes = Arc::clone(&writes);
            s.spawn(move || {
                for i in 0..50 {
                    map.put(int(1), text(&format!("{t}-{i}"))).unwrap();
                    writes.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    assert_eq!(writes.load(Ordering::SeqCst), 400);
    assert_eq!(map.size(), 1);
    assert!(map.get(&int(1)).is_some());
}

//! End-to-end persistence tests over the disk store: bulk load and full
//! scan, reopen round-trips, and physical node-file accounting.

use std::path::Path;

use tamarack::{DiskNodeStore, Forest, OpenMode, StoreSettings};
use tempfile::tempdir;

fn open_forest(dir: &Path, settings: StoreSettings) -> Forest<DiskNodeStore> {
    let store = DiskNodeStore::open(dir, settings, OpenMode::ReadWrite).unwrap();
    Forest::open(store).unwrap()
}

#[test]
fn thousand_keys_scan_in_order_across_reopen() {
    let dir = tempdir().unwrap();
    let settings = StoreSettings {
        key_size: 4,
        node_size: 128,
        ..StoreSettings::default()
    };

    {
        let mut forest = open_forest(dir.path(), settings);
        let t = forest.new_tree().unwrap();
        for i in 0..1024u32 {
            forest
                .insert(t, &i.to_be_bytes(), i.to_string().as_bytes())
                .unwrap();
        }
        forest.commit().unwrap();
    }

    let mut forest = open_forest(dir.path(), settings);
    let trees = forest.tree_ids();
    assert_eq!(trees.len(), 1);
    let t = trees[0];

    let pairs = forest
        .lookup_range(t, &0u32.to_be_bytes(), &u32::MAX.to_be_bytes())
        .unwrap();
    assert_eq!(pairs.len(), 1024);
    for (i, (key, value)) in pairs.iter().enumerate() {
        assert_eq!(key.as_slice(), &(i as u32).to_be_bytes());
        assert_eq!(value.as_slice(), i.to_string().as_bytes());
    }
}

#[test]
fn shrunken_tree_leaves_exactly_two_node_files() {
    let dir = tempdir().unwrap();
    let settings = StoreSettings {
        key_size: 19,
        node_size: 4096,
        ..StoreSettings::default()
    };

    let key = |i: usize| format!("key-{i:015}").into_bytes();
    let value = vec![0x5A; 128];

    let mut forest = open_forest(dir.path(), settings);
    let t = forest.new_tree().unwrap();
    for i in 0..100 {
        forest.insert(t, &key(i), &value).unwrap();
    }
    for i in 1..100 {
        forest.remove(t, &key(i)).unwrap();
    }
    forest.commit().unwrap();

    assert_eq!(forest.lookup(t, &key(0)).unwrap(), value);

    // only the root index node and its single leaf child remain on disk
    let mut node_files = 0;
    let mut pending = vec![dir.path().join("nodes")];
    while let Some(d) = pending.pop() {
        for entry in std::fs::read_dir(&d).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                node_files += 1;
            }
        }
    }
    assert_eq!(node_files, 2);
}

#[test]
fn uncommitted_mutations_do_not_survive_reopen() {
    let dir = tempdir().unwrap();
    let settings = StoreSettings {
        key_size: 4,
        node_size: 128,
        ..StoreSettings::default()
    };

    {
        let mut forest = open_forest(dir.path(), settings);
        let t = forest.new_tree().unwrap();
        forest.insert(t, &1u32.to_be_bytes(), b"durable").unwrap();
        forest.commit().unwrap();
        forest.insert(t, &2u32.to_be_bytes(), b"volatile").unwrap();
        // dropped without commit
    }

    let mut forest = open_forest(dir.path(), settings);
    let t = forest.tree_ids()[0];
    assert_eq!(forest.lookup(t, &1u32.to_be_bytes()).unwrap(), b"durable");
    assert!(forest.lookup(t, &2u32.to_be_bytes()).is_err());
}

#[test]
fn empty_forest_round_trips() {
    let dir = tempdir().unwrap();
    let settings = StoreSettings {
        key_size: 4,
        node_size: 128,
        ..StoreSettings::default()
    };
    {
        let mut forest = open_forest(dir.path(), settings);
        forest.commit().unwrap();
    }
    let forest = open_forest(dir.path(), settings);
    assert!(forest.tree_ids().is_empty());
}

#[test]
fn tree_removal_persists() {
    let dir = tempdir().unwrap();
    let settings = StoreSettings {
        key_size: 4,
        node_size: 128,
        ..StoreSettings::default()
    };
    {
        let mut forest = open_forest(dir.path(), settings);
        let a = forest.new_tree().unwrap();
        let b = forest.new_tree().unwrap();
        forest.insert(a, &1u32.to_be_bytes(), b"a").unwrap();
        forest.insert(b, &1u32.to_be_bytes(), b"b").unwrap();
        forest.commit().unwrap();
        forest.remove_tree(a).unwrap();
        forest.commit().unwrap();
    }
    let mut forest = open_forest(dir.path(), settings);
    let trees = forest.tree_ids();
    assert_eq!(trees.len(), 1);
    assert_eq!(forest.lookup(trees[0], &1u32.to_be_bytes()).unwrap(), b"b");
}

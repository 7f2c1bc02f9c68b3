//! Clone isolation across a chain of derived trees, committed to disk
//! and enumerated again after reopen.

use tamarack::{DiskNodeStore, Forest, OpenMode, StoreSettings};
use tempfile::tempdir;

fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

#[test]
fn clone_chain_keeps_every_generation_intact() {
    let dir = tempdir().unwrap();
    let settings = StoreSettings {
        key_size: 4,
        node_size: 128,
        ..StoreSettings::default()
    };

    {
        let store = DiskNodeStore::open(dir.path(), settings, OpenMode::ReadWrite).unwrap();
        let mut forest = Forest::open(store).unwrap();

        // A: all 1024 keys
        let a = forest.new_tree().unwrap();
        for i in 0..1024u32 {
            forest.insert(a, &key(i), i.to_string().as_bytes()).unwrap();
        }

        // B = clone(A), remove the odd keys
        let b = forest.clone_tree(a).unwrap();
        for i in (1..1024u32).step_by(2) {
            forest.remove(b, &key(i)).unwrap();
        }

        // C = clone(B), re-insert the odd keys
        let c = forest.clone_tree(b).unwrap();
        for i in (1..1024u32).step_by(2) {
            forest.insert(c, &key(i), i.to_string().as_bytes()).unwrap();
        }

        // D = clone(C), remove the even keys
        let d = forest.clone_tree(c).unwrap();
        for i in (0..1024u32).step_by(2) {
            forest.remove(d, &key(i)).unwrap();
        }

        forest.commit().unwrap();
    }

    let store = DiskNodeStore::open(dir.path(), settings, OpenMode::ReadWrite).unwrap();
    let mut forest = Forest::open(store).unwrap();
    let trees = forest.tree_ids();
    assert_eq!(trees.len(), 4);
    let (a, b, c, d) = (trees[0], trees[1], trees[2], trees[3]);

    let scan = |forest: &mut Forest<DiskNodeStore>, t| {
        forest
            .lookup_range(t, &key(0), &u32::MAX.to_be_bytes())
            .unwrap()
    };

    // A: untouched by everything downstream
    let pairs = scan(&mut forest, a);
    assert_eq!(pairs.len(), 1024);
    for (i, (k, v)) in pairs.iter().enumerate() {
        assert_eq!(k.as_slice(), &key(i as u32));
        assert_eq!(v.as_slice(), i.to_string().as_bytes());
    }

    // B: the 512 even keys
    let pairs = scan(&mut forest, b);
    assert_eq!(pairs.len(), 512);
    assert!(pairs
        .iter()
        .all(|(k, _)| u32::from_be_bytes([k[0], k[1], k[2], k[3]]) % 2 == 0));

    // C: all 1024 again
    assert_eq!(scan(&mut forest, c).len(), 1024);

    // D: the 512 odd keys
    let pairs = scan(&mut forest, d);
    assert_eq!(pairs.len(), 512);
    assert!(pairs
        .iter()
        .all(|(k, _)| u32::from_be_bytes([k[0], k[1], k[2], k[3]]) % 2 == 1));
}

#[test]
fn forest_stays_consistent_through_the_chain() {
    let settings = StoreSettings {
        key_size: 4,
        node_size: 128,
        ..StoreSettings::default()
    };
    let dir = tempdir().unwrap();
    let store = DiskNodeStore::open(dir.path(), settings, OpenMode::ReadWrite).unwrap();
    let mut forest = Forest::open(store).unwrap();

    let a = forest.new_tree().unwrap();
    for i in 0..256u32 {
        forest.insert(a, &key(i), b"value").unwrap();
    }
    let b = forest.clone_tree(a).unwrap();
    for i in 0..128u32 {
        forest.remove(b, &key(i)).unwrap();
    }
    forest.remove_tree(a).unwrap();
    forest.commit().unwrap();

    assert_eq!(tamarack::fsck::check(&mut forest).unwrap(), Vec::new());
    assert_eq!(forest.count_range(b, &key(0), &key(255)).unwrap(), 128);
}

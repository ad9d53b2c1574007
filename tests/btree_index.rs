// B-tree ordering, splitting and rebuild
use domstore::core::constants::{BRANCH, KEY_NOT_FOUND};
use domstore::{BTreeIndex, IndexQuery, Operator, PagedStore, StoreOptions, Value};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

fn cleanup(path: &str) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}.lock", path));
    let _ = std::fs::remove_file(format!("{}.journal", path));
}

fn small_pages() -> StoreOptions {
    StoreOptions {
        page_size: 256,
        page_header_size: 120,
        recovery_enabled: false,
        ..Default::default()
    }
}

fn all_keys(tree: &BTreeIndex) -> Vec<Value> {
    let mut keys = Vec::new();
    tree.query(&IndexQuery::any(), |key, _| {
        keys.push(key.clone());
        true
    })
    .unwrap();
    keys
}

#[test]
fn test_alphabet_forces_branch_root() {
    let path = "/tmp/test_btree_alphabet.dbx";
    cleanup(path);

    let tree = BTreeIndex::open(path, &small_pages()).unwrap();
    let letters: Vec<String> = (b'a'..=b'z').map(|c| (c as char).to_string()).collect();
    for (i, letter) in letters.iter().enumerate() {
        tree.add_value(None, &Value::from(letter.as_str()), i as u64).unwrap();
    }

    let stats = tree.file().metrics().snapshot();
    assert!(stats.page_splits >= 3, "only {} splits", stats.page_splits);

    let keys: Vec<String> = all_keys(&tree).iter().map(|k| k.to_string()).collect();
    assert_eq!(keys, letters);

    let root = tree.file().read_page(tree.root_page()).unwrap();
    assert_eq!(root.status(), BRANCH);
    let shape = tree.tree_statistics().unwrap();
    assert!(shape.leaf_pages >= 2);
    assert!(shape.depth >= 2);
    assert_eq!(shape.entries, 26);

    for (i, letter) in letters.iter().enumerate() {
        assert_eq!(tree.find_value(&Value::from(letter.as_str())).unwrap(), i as u64);
    }

    tree.close().unwrap();
    cleanup(path);
}

#[test]
fn test_random_operations_keep_keys_ordered() {
    let path = "/tmp/test_btree_random_ops.dbx";
    cleanup(path);

    let tree = BTreeIndex::open(path, &small_pages()).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for step in 0..600u64 {
        let key = format!("k{:04}", rng.gen_range(0..300));
        if rng.gen_bool(0.7) {
            let old = tree.add_value(None, &Value::from(key.as_str()), step).unwrap();
            let expected = model.insert(key.into_bytes(), step).unwrap_or(KEY_NOT_FOUND);
            assert_eq!(old, expected);
        } else {
            let old = tree.remove_value(None, &Value::from(key.as_str())).unwrap();
            let expected = model.remove(key.as_bytes()).unwrap_or(KEY_NOT_FOUND);
            assert_eq!(old, expected);
        }

        if step % 50 == 0 {
            let keys = all_keys(&tree);
            assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order at step {}", step);
            assert_eq!(keys.len(), model.len());
        }
    }

    let mut found = Vec::new();
    tree.query(&IndexQuery::any(), |key, ptr| {
        found.push((key.as_bytes().to_vec(), ptr));
        true
    })
    .unwrap();
    let expected: Vec<(Vec<u8>, u64)> = model.into_iter().collect();
    assert_eq!(found, expected);

    tree.close().unwrap();
    cleanup(path);
}

#[test]
fn test_shuffled_inserts_and_prefix_queries() {
    let path = "/tmp/test_btree_shuffled.dbx";
    cleanup(path);

    let tree = BTreeIndex::open(path, &small_pages()).unwrap();
    let mut keys: Vec<String> = (0..400).map(|i| format!("doc{:02}/node{:04}", i % 7, i)).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(42));
    for (i, key) in keys.iter().enumerate() {
        tree.add_value(None, &Value::from(key.as_str()), i as u64).unwrap();
    }

    let doc3 = tree.find_values_by_prefix(&Value::from("doc03/")).unwrap();
    assert_eq!(doc3.len(), keys.iter().filter(|k| k.starts_with("doc03/")).count());
    assert!(doc3.windows(2).all(|w| w[0].0 < w[1].0));

    let mut in_range = 0;
    tree.query(
        &IndexQuery::between(Operator::Bw, "doc01/", "doc02/"),
        |_, _| {
            in_range += 1;
            true
        },
    )
    .unwrap();
    assert_eq!(in_range, keys.iter().filter(|k| k.starts_with("doc01/")).count());

    let removed = tree
        .remove_query(None, &IndexQuery::new(Operator::TruncRight, "doc00/"), |_, _| true)
        .unwrap();
    assert_eq!(removed, keys.iter().filter(|k| k.starts_with("doc00/")).count());
    assert!(tree.find_values_by_prefix(&Value::from("doc00/")).unwrap().is_empty());

    tree.close().unwrap();
    cleanup(path);
}

#[test]
fn test_rebuild_preserves_entries() {
    let path = "/tmp/test_btree_rebuild.dbx";
    cleanup(path);

    let tree = BTreeIndex::open(path, &small_pages()).unwrap();
    for i in 0..250u64 {
        tree.add_value(None, &Value::from(format!("key{:05}", i * 3).as_str()), i).unwrap();
    }
    let before = all_keys(&tree);

    tree.rebuild(true).unwrap();
    assert_eq!(all_keys(&tree), before);
    assert_eq!(tree.find_value(&Value::from("key00300")).unwrap(), 100);
    assert_eq!(tree.tree_statistics().unwrap().entries, 250);

    tree.add_value(None, &Value::from("key00001"), 999).unwrap();
    assert_eq!(tree.find_value(&Value::from("key00001")).unwrap(), 999);

    tree.close().unwrap();
    cleanup(path);
}

#[test]
fn test_reopen_keeps_tree() {
    let path = "/tmp/test_btree_reopen.dbx";
    cleanup(path);

    {
        let tree = BTreeIndex::open(path, &small_pages()).unwrap();
        for i in 0..120u64 {
            tree.add_value(None, &Value::from(format!("persist{:03}", i).as_str()), i * 10)
                .unwrap();
        }
        tree.close().unwrap();
    }

    let tree = BTreeIndex::open(path, &small_pages()).unwrap();
    assert_eq!(tree.find_value(&Value::from("persist077")).unwrap(), 770);
    assert_eq!(all_keys(&tree).len(), 120);

    let mut dump = Vec::new();
    tree.dump(&mut dump).unwrap();
    assert!(!dump.is_empty());

    tree.close().unwrap();
    cleanup(path);
}

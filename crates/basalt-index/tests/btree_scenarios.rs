//! End-to-end B+Tree scenarios with small fan-outs (leaf and internal
//! max size 4) so splits and merges fire constantly.

use basalt_buffer::{BufferPoolManager, DiskManager};
use basalt_common::page::PageId;
use basalt_common::{BufferPoolConfig, DiskManagerConfig};
use basalt_index::btree::{internal, leaf, node};
use basalt_index::{BPlusTree, OrdComparator};
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::tempdir;

type TestTree = BPlusTree<i64, i64, OrdComparator<i64>>;

fn open_pool(path: &std::path::Path, num_frames: usize) -> Arc<BufferPoolManager> {
    let disk = Arc::new(
        DiskManager::new(DiskManagerConfig {
            path: path.to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap(),
    );
    Arc::new(BufferPoolManager::new(
        BufferPoolConfig { num_frames },
        disk,
        None,
    ))
}

fn open_tree(pool: Arc<BufferPoolManager>, name: &str) -> TestTree {
    BPlusTree::open(name, pool, OrdComparator::new(), 4, 4).unwrap()
}

/// Walks every node checking the structural laws: size bounds on non-root
/// nodes, parent back-pointers, equal leaf depth, and in-node key order.
fn check_invariants(tree: &TestTree, pool: &BufferPoolManager) {
    if tree.is_empty() {
        return;
    }

    let root = tree.root_page_id();
    let mut leaf_depth: Option<u32> = None;
    let mut queue = VecDeque::new();
    queue.push_back((root, PageId::INVALID, 0u32));

    while let Some((page_id, expected_parent, depth)) = queue.pop_front() {
        let frame = pool.fetch_page(page_id).unwrap();
        let guard = frame.latch_read();
        let data = &guard[..];

        assert_eq!(
            node::parent_page_id(data),
            expected_parent,
            "parent pointer of {} is wrong",
            page_id
        );

        let size = node::size(data);
        let is_root = page_id == root;
        if !is_root {
            assert!(
                size >= node::min_size(data),
                "{} is underfull: {} < {}",
                page_id,
                size,
                node::min_size(data)
            );
        }
        assert!(size <= node::max_size(data), "{} is overfull", page_id);

        if node::is_leaf(data) {
            match leaf_depth {
                None => leaf_depth = Some(depth),
                Some(d) => assert_eq!(d, depth, "leaf {} at unequal depth", page_id),
            }
            for i in 1..size {
                assert!(
                    leaf::key_at::<i64, i64>(data, i - 1) < leaf::key_at::<i64, i64>(data, i),
                    "leaf {} keys out of order",
                    page_id
                );
            }
        } else {
            assert!(size >= 2 || !is_root, "internal root {} must have two children", page_id);
            for i in 2..size {
                assert!(
                    internal::key_at::<i64>(data, i - 1) < internal::key_at::<i64>(data, i),
                    "internal {} keys out of order",
                    page_id
                );
            }
            for i in 0..size {
                queue.push_back((internal::value_at::<i64>(data, i), page_id, depth + 1));
            }
        }

        drop(guard);
        pool.unpin_page(page_id, false);
    }
}

fn collect_keys(tree: &TestTree) -> Vec<i64> {
    tree.begin().unwrap().map(|(k, _)| k).collect()
}

#[test]
fn scenario_small_inserts_split_to_height_two() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s1.db"), 64);
    let tree = open_tree(pool.clone(), "s1");

    for k in 1..=5i64 {
        assert!(tree.insert(&k, &k).unwrap());
    }

    assert_eq!(tree.get_value(&3).unwrap(), Some(3));
    assert_eq!(collect_keys(&tree), vec![1, 2, 3, 4, 5]);
    assert_eq!(tree.height(), 2);
    check_invariants(&tree, &pool);
}

#[test]
fn scenario_remove_prefix_then_iterate() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s2.db"), 64);
    let tree = open_tree(pool.clone(), "s2");

    for k in 1..=10i64 {
        tree.insert(&k, &k).unwrap();
    }
    check_invariants(&tree, &pool);
    let height_before = tree.height();

    for k in 1..=5i64 {
        tree.remove(&k).unwrap();
        check_invariants(&tree, &pool);
    }

    assert_eq!(collect_keys(&tree), vec![6, 7, 8, 9, 10]);
    assert!(tree.height() <= height_before);
    for k in 1..=5i64 {
        assert_eq!(tree.get_value(&k).unwrap(), None);
    }
    for k in 6..=10i64 {
        assert_eq!(tree.get_value(&k).unwrap(), Some(k));
    }
}

#[test]
fn scenario_duplicate_insert_is_rejected() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s3.db"), 64);
    let tree = open_tree(pool, "s3");

    for k in [10i64, 20, 30] {
        assert!(tree.insert(&k, &k).unwrap());
    }

    assert!(!tree.insert(&20, &9999).unwrap());
    assert_eq!(tree.get_value(&20).unwrap(), Some(20));
}

#[test]
fn scenario_random_thousand_insert_then_drain() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s4.db"), 128);
    let tree = open_tree(pool.clone(), "s4");

    let mut keys: Vec<i64> = (1..=1000).collect();
    let mut rng = rand::thread_rng();
    keys.shuffle(&mut rng);

    for &k in &keys {
        assert!(tree.insert(&k, &(k * 7)).unwrap());
    }
    check_invariants(&tree, &pool);

    let collected = collect_keys(&tree);
    assert_eq!(collected.len(), 1000);
    assert!(collected.windows(2).all(|w| w[0] < w[1]));

    keys.shuffle(&mut rng);
    for (i, &k) in keys.iter().enumerate() {
        tree.remove(&k).unwrap();
        if i % 100 == 0 {
            check_invariants(&tree, &pool);
        }
    }

    assert!(tree.is_empty());
    assert!(!tree.root_page_id().is_valid());
    assert_eq!(tree.height(), 0);
}

#[test]
fn scenario_reverse_and_interleaved_orders() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s5.db"), 64);
    let tree = open_tree(pool.clone(), "s5");

    // Descending order stresses the leftmost split path.
    for k in (1..=200i64).rev() {
        tree.insert(&k, &k).unwrap();
    }
    check_invariants(&tree, &pool);
    assert_eq!(collect_keys(&tree), (1..=200).collect::<Vec<_>>());

    // Remove evens, keep odds.
    for k in (2..=200i64).step_by(2) {
        tree.remove(&k).unwrap();
    }
    check_invariants(&tree, &pool);
    let odds: Vec<i64> = (1..=200).step_by(2).collect();
    assert_eq!(collect_keys(&tree), odds);
}

#[test]
fn scenario_begin_at_mid_range() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s6.db"), 64);
    let tree = open_tree(pool, "s6");

    for k in (0..100i64).map(|i| i * 3) {
        tree.insert(&k, &k).unwrap();
    }

    // 50 is absent; iteration starts at the next present key.
    let keys: Vec<i64> = tree.begin_at(&50).unwrap().map(|(k, _)| k).take(3).collect();
    assert_eq!(keys, vec![51, 54, 57]);
}

#[test]
fn scenario_reopen_from_header_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s7.db");

    {
        let pool = open_pool(&path, 64);
        let tree = open_tree(pool.clone(), "persistent");
        for k in 1..=50i64 {
            tree.insert(&k, &(k + 1000)).unwrap();
        }
        drop(tree);
        pool.flush_all().unwrap();
    }

    let pool = open_pool(&path, 64);
    let tree = open_tree(pool.clone(), "persistent");

    assert!(!tree.is_empty());
    for k in 1..=50i64 {
        assert_eq!(tree.get_value(&k).unwrap(), Some(k + 1000));
    }
    check_invariants(&tree, &pool);
}

#[test]
fn scenario_file_loaders() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s8.db"), 64);
    let tree = open_tree(pool, "s8");

    let insert_path = dir.path().join("keys.txt");
    std::fs::write(&insert_path, "5\n3\n9\n1\n7\n").unwrap();
    tree.insert_from_file(&insert_path).unwrap();

    assert_eq!(collect_keys(&tree), vec![1, 3, 5, 7, 9]);

    let remove_path = dir.path().join("gone.txt");
    std::fs::write(&remove_path, "3\n7\n").unwrap();
    tree.remove_from_file(&remove_path).unwrap();

    assert_eq!(collect_keys(&tree), vec![1, 5, 9]);
}

#[test]
fn scenario_dot_dump_structure() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s9.db"), 64);
    let tree = open_tree(pool, "s9");

    for k in 1..=20i64 {
        tree.insert(&k, &k).unwrap();
    }

    let dot = tree.to_dot().unwrap();
    assert!(dot.starts_with("digraph G {"));
    assert!(dot.contains("color=pink"));
    assert!(dot.contains("color=green"));
    assert!(dot.contains("rank=same"));
    assert!(dot.trim_end().ends_with('}'));

    // Every key appears in some leaf cell.
    for k in 1..=20i64 {
        assert!(dot.contains(&format!(">{}<", k)), "key {} missing from dump", k);
    }
}

#[test]
fn scenario_empty_tree_surface() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir.path().join("s10.db"), 64);
    let tree = open_tree(pool, "s10");

    assert!(tree.is_empty());
    assert_eq!(tree.get_value(&1).unwrap(), None);
    tree.remove(&1).unwrap();
    assert!(tree.begin().unwrap().is_end());
    assert!(tree.end().is_end());

    let dot = tree.to_dot().unwrap();
    assert!(dot.starts_with("digraph G {"));
}

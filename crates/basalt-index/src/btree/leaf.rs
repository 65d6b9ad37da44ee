//! Leaf node body: an array of (key, value) cells sorted by key.
//!
//! Cell `i` sits at `NODE_HEADER_SIZE + i * (key_len + value_len)`. Leaves
//! chain through the common header's next page id, enumerating keys in
//! ascending order across the whole tree.

use super::node::{self, NODE_HEADER_SIZE};
use crate::keys::{IndexKey, IndexValue, KeyComparator};
use basalt_common::page::{PageId, PageType};
use basalt_common::PAGE_SIZE;
use std::cmp::Ordering;

#[inline]
fn entry_size<K: IndexKey, V: IndexValue>() -> usize {
    K::encoded_len() + V::encoded_len()
}

/// Maximum number of entries a page can physically hold.
pub fn capacity<K: IndexKey, V: IndexValue>() -> usize {
    (PAGE_SIZE - NODE_HEADER_SIZE) / entry_size::<K, V>()
}

#[inline]
fn key_offset<K: IndexKey, V: IndexValue>(index: usize) -> usize {
    NODE_HEADER_SIZE + index * entry_size::<K, V>()
}

#[inline]
fn value_offset<K: IndexKey, V: IndexValue>(index: usize) -> usize {
    key_offset::<K, V>(index) + K::encoded_len()
}

/// Initializes a zeroed page as an empty leaf.
pub fn init<K: IndexKey, V: IndexValue>(
    data: &mut [u8],
    page_id: PageId,
    parent: PageId,
    max_size: u16,
) {
    debug_assert!((max_size as usize) <= capacity::<K, V>());
    node::init(data, PageType::Leaf, page_id, parent, max_size);
}

#[inline]
pub fn key_at<K: IndexKey, V: IndexValue>(data: &[u8], index: usize) -> K {
    debug_assert!(index < node::size(data));
    let offset = key_offset::<K, V>(index);
    K::decode(&data[offset..offset + K::encoded_len()])
}

#[inline]
pub fn value_at<K: IndexKey, V: IndexValue>(data: &[u8], index: usize) -> V {
    debug_assert!(index < node::size(data));
    let offset = value_offset::<K, V>(index);
    V::decode(&data[offset..offset + V::encoded_len()])
}

/// Reads the (key, value) pair at `index`.
pub fn item_at<K: IndexKey, V: IndexValue>(data: &[u8], index: usize) -> (K, V) {
    (key_at::<K, V>(data, index), value_at::<K, V>(data, index))
}

fn write_entry<K: IndexKey, V: IndexValue>(data: &mut [u8], index: usize, key: &K, value: &V) {
    let ko = key_offset::<K, V>(index);
    key.encode(&mut data[ko..ko + K::encoded_len()]);
    let vo = value_offset::<K, V>(index);
    value.encode(&mut data[vo..vo + V::encoded_len()]);
}

/// Linear scan for an exact key.
pub fn lookup<K: IndexKey, V: IndexValue, C: KeyComparator<K>>(
    data: &[u8],
    key: &K,
    comparator: &C,
) -> Option<V> {
    for i in 0..node::size(data) {
        if comparator.compare(key, &key_at::<K, V>(data, i)) == Ordering::Equal {
            return Some(value_at::<K, V>(data, i));
        }
    }
    None
}

/// Index of the first entry whose key is >= the target, if any.
pub fn key_index<K: IndexKey, V: IndexValue, C: KeyComparator<K>>(
    data: &[u8],
    key: &K,
    comparator: &C,
) -> Option<usize> {
    (0..node::size(data))
        .find(|&i| comparator.compare(&key_at::<K, V>(data, i), key) != Ordering::Less)
}

/// Inserts a (key, value) pair in sorted position. The key must be absent
/// and the node must have room. Returns the new size.
pub fn insert<K: IndexKey, V: IndexValue, C: KeyComparator<K>>(
    data: &mut [u8],
    key: &K,
    value: &V,
    comparator: &C,
) -> usize {
    let size = node::size(data);
    debug_assert!(size < capacity::<K, V>());

    let point = key_index::<K, V, C>(data, key, comparator).unwrap_or(size);
    debug_assert!(
        point == size || comparator.compare(&key_at::<K, V>(data, point), key) != Ordering::Equal,
        "duplicate key inserted into leaf"
    );

    let src = key_offset::<K, V>(point);
    let end = key_offset::<K, V>(size);
    data.copy_within(src..end, src + entry_size::<K, V>());

    node::set_size(data, size + 1);
    write_entry::<K, V>(data, point, key, value);
    size + 1
}

/// Removes a key if present. Returns the new size, or None when absent.
pub fn remove<K: IndexKey, V: IndexValue, C: KeyComparator<K>>(
    data: &mut [u8],
    key: &K,
    comparator: &C,
) -> Option<usize> {
    let size = node::size(data);
    for i in 0..size {
        if comparator.compare(key, &key_at::<K, V>(data, i)) == Ordering::Equal {
            let src = key_offset::<K, V>(i + 1);
            let end = key_offset::<K, V>(size);
            data.copy_within(src..end, key_offset::<K, V>(i));
            node::set_size(data, size - 1);
            return Some(size - 1);
        }
    }
    None
}

/// Moves the upper half of this leaf's entries to an empty sibling. When the
/// size is odd the sibling takes the extra entry. Returns the promoted key,
/// which is the sibling's first key.
pub fn move_half_to<K: IndexKey, V: IndexValue>(src: &mut [u8], dst: &mut [u8]) -> K {
    let total = node::size(src);
    debug_assert_eq!(node::size(dst), 0);

    let start = total / 2;
    let count = total - start;

    let from = key_offset::<K, V>(start);
    let to = key_offset::<K, V>(total);
    dst[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (to - from)].copy_from_slice(&src[from..to]);

    node::set_size(src, start);
    node::set_size(dst, count);

    key_at::<K, V>(dst, 0)
}

/// Moves every entry of `src` to the end of `dst` (its left sibling) and
/// carries `src`'s next pointer over, keeping the leaf chain intact.
pub fn move_all_to<K: IndexKey, V: IndexValue>(src: &mut [u8], dst: &mut [u8]) {
    let src_size = node::size(src);
    let dst_size = node::size(dst);
    debug_assert!(dst_size + src_size <= capacity::<K, V>());

    let from = key_offset::<K, V>(0);
    let to = key_offset::<K, V>(src_size);
    let dst_from = key_offset::<K, V>(dst_size);
    dst[dst_from..dst_from + (to - from)].copy_from_slice(&src[from..to]);

    node::set_size(dst, dst_size + src_size);
    node::set_size(src, 0);
    node::set_next_page_id(dst, node::next_page_id(src));
}

/// Moves `src`'s first entry to the end of `dst` (its left sibling).
pub fn move_first_to_end_of<K: IndexKey, V: IndexValue>(src: &mut [u8], dst: &mut [u8]) {
    let src_size = node::size(src);
    let dst_size = node::size(dst);
    debug_assert!(src_size > 1);

    let (key, value) = item_at::<K, V>(src, 0);
    node::set_size(dst, dst_size + 1);
    write_entry::<K, V>(dst, dst_size, &key, &value);

    let from = key_offset::<K, V>(1);
    let to = key_offset::<K, V>(src_size);
    src.copy_within(from..to, key_offset::<K, V>(0));
    node::set_size(src, src_size - 1);
}

/// Moves `src`'s last entry to the front of `dst` (its right sibling).
pub fn move_last_to_front_of<K: IndexKey, V: IndexValue>(src: &mut [u8], dst: &mut [u8]) {
    let src_size = node::size(src);
    let dst_size = node::size(dst);
    debug_assert!(src_size > 1);

    let (key, value) = item_at::<K, V>(src, src_size - 1);
    node::set_size(src, src_size - 1);

    let from = key_offset::<K, V>(0);
    let to = key_offset::<K, V>(dst_size);
    dst.copy_within(from..to, from + entry_size::<K, V>());
    node::set_size(dst, dst_size + 1);
    write_entry::<K, V>(dst, 0, &key, &value);
}

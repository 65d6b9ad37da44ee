//! Concurrent B+Tree index.
//!
//! Every node lives in exactly one page and is reached through the buffer
//! pool. A node page carries a tagged common header ([`node`]) followed by a
//! kind-specific body ([`internal`] routes, [`leaf`] stores data and the
//! sibling pointer). [`tree::BPlusTree`] implements the operations and the
//! latch-crabbing protocol; [`iterator::TreeIterator`] walks the leaf chain.

pub mod dot;
pub mod internal;
pub mod iterator;
pub mod leaf;
pub mod node;
pub mod tree;

pub use iterator::TreeIterator;
pub use tree::BPlusTree;

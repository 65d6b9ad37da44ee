//! Basalt buffer management: disk manager, frames, replacement policy, and
//! the buffer pool manager that ties them together.
//!
//! All page access in Basalt goes through [`BufferPoolManager`]. The pool
//! owns a fixed array of [`Frame`]s, a page table, and a free list; victim
//! selection is delegated to the [`Replacer`] and page I/O to the
//! [`DiskManager`].

pub mod disk;
pub mod frame;
pub mod log;
pub mod pool;
pub mod replacer;

pub use disk::DiskManager;
pub use frame::{Frame, FrameId};
pub use log::LogManager;
pub use pool::{BufferPoolManager, BufferPoolStats, PageReadGuard, PageWriteGuard};
pub use replacer::{ClockReplacer, Replacer};

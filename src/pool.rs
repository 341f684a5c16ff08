//! Shared buffer pool backing intake stores and response payloads.
//!
//! Blocks are segregated into size classes with lock-free free lists so any
//! thread can lease and return memory without contending on a mutex. A
//! [`Lease`] owns its block exclusively and returns it on drop, which is the
//! only way a block becomes reusable.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_queue::ArrayQueue;

/// Block size classes held by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 4 KiB blocks for request heads and small responses.
    Small,
    /// 64 KiB blocks for typical payloads.
    Medium,
    /// 1 MiB blocks for large payloads.
    Large,
}

impl SizeClass {
    /// Capacity of blocks in this class.
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            Self::Small => 4 * 1024,
            Self::Medium => 64 * 1024,
            Self::Large => 1024 * 1024,
        }
    }

    /// Smallest class able to satisfy `min`, or `None` when the request is
    /// larger than any class.
    fn for_request(min: usize) -> Option<Self> {
        if min <= Self::Small.block_size() {
            Some(Self::Small)
        } else if min <= Self::Medium.block_size() {
            Some(Self::Medium)
        } else if min <= Self::Large.block_size() {
            Some(Self::Large)
        } else {
            None
        }
    }

    /// Largest class whose promised capacity a block of `capacity` bytes can
    /// honour. Returned blocks are filed here so a popped block never has
    /// less capacity than its class advertises.
    fn for_return(capacity: usize) -> Option<Self> {
        if capacity >= Self::Large.block_size() {
            Some(Self::Large)
        } else if capacity >= Self::Medium.block_size() {
            Some(Self::Medium)
        } else if capacity >= Self::Small.block_size() {
            Some(Self::Small)
        } else {
            None
        }
    }
}

/// Free-list capacities per size class.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Retained 4 KiB blocks.
    pub small_blocks: usize,
    /// Retained 64 KiB blocks.
    pub medium_blocks: usize,
    /// Retained 1 MiB blocks.
    pub large_blocks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_blocks: 256,
            medium_blocks: 64,
            large_blocks: 8,
        }
    }
}

/// Counters describing pool behaviour since creation.
#[derive(Debug, Default)]
pub struct PoolStats {
    leases: AtomicU64,
    reused: AtomicU64,
    fresh: AtomicU64,
    outsized: AtomicU64,
}

impl PoolStats {
    /// Total leases issued.
    #[must_use]
    pub fn leases(&self) -> u64 { self.leases.load(Ordering::Relaxed) }

    /// Leases satisfied from a free list.
    #[must_use]
    pub fn reused(&self) -> u64 { self.reused.load(Ordering::Relaxed) }

    /// Leases that required a fresh allocation.
    #[must_use]
    pub fn fresh(&self) -> u64 { self.fresh.load(Ordering::Relaxed) }

    /// Leases larger than every size class; these bypass the free lists.
    #[must_use]
    pub fn outsized(&self) -> u64 { self.outsized.load(Ordering::Relaxed) }
}

/// Process-wide arena of reusable byte blocks.
pub struct BufferPool {
    small: ArrayQueue<Vec<u8>>,
    medium: ArrayQueue<Vec<u8>>,
    large: ArrayQueue<Vec<u8>>,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a pool with the given free-list capacities.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            small: ArrayQueue::new(config.small_blocks.max(1)),
            medium: ArrayQueue::new(config.medium_blocks.max(1)),
            large: ArrayQueue::new(config.large_blocks.max(1)),
            stats: PoolStats::default(),
        })
    }

    /// Create a pool with the default free-list capacities.
    #[must_use]
    pub fn with_defaults() -> Arc<Self> { Self::new(&PoolConfig::default()) }

    /// Lease a block with capacity of at least `min` bytes.
    ///
    /// The block arrives empty. Dropping the [`Lease`] returns the block to
    /// the pool; until then it is owned exclusively by the caller.
    #[must_use]
    pub fn lease(self: &Arc<Self>, min: usize) -> Lease {
        self.stats.leases.fetch_add(1, Ordering::Relaxed);
        let block = match SizeClass::for_request(min) {
            Some(class) => match self.free_list(class).pop() {
                Some(block) => {
                    self.stats.reused.fetch_add(1, Ordering::Relaxed);
                    block
                }
                None => {
                    self.stats.fresh.fetch_add(1, Ordering::Relaxed);
                    Vec::with_capacity(class.block_size())
                }
            },
            None => {
                self.stats.outsized.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(min)
            }
        };
        Lease {
            block: Some(block),
            pool: Arc::clone(self),
        }
    }

    /// Behaviour counters for this pool.
    #[must_use]
    pub fn stats(&self) -> &PoolStats { &self.stats }

    fn free_list(&self, class: SizeClass) -> &ArrayQueue<Vec<u8>> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => &self.large,
        }
    }

    fn release(&self, mut block: Vec<u8>) {
        block.clear();
        if let Some(class) = SizeClass::for_return(block.capacity()) {
            // Push fails when the free list is full; the block is then freed.
            let _ = self.free_list(class).push(block);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("small_free", &self.small.len())
            .field("medium_free", &self.medium.len())
            .field("large_free", &self.large.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive ownership of one pool block.
///
/// Dereferences to the underlying `Vec<u8>`; the vector may grow past its
/// class size, in which case it is refiled by its real capacity on return.
pub struct Lease {
    block: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Lease {
    /// Capacity of the leased block.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, Vec::capacity)
    }
}

impl Deref for Lease {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.block.as_ref().unwrap_or(&EMPTY_BLOCK)
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.block.get_or_insert_with(Vec::new)
    }
}

static EMPTY_BLOCK: Vec<u8> = Vec::new();

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.pool.release(block);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#![no_std]

//! A best-fit allocator for sound RAM.
//!
//! Sound RAM is a separate 2 MiB memory bank that the CPU only reaches through
//! a bus, so it can't be managed like an ordinary heap: nothing can be written
//! into free blocks, and callers get offsets instead of pointers. All of the
//! bookkeeping here lives in main memory as an address-ordered ledger of
//! extents.
//!
//! The algorithm is deliberately simple, on the assumption that clients
//! allocate or free a few large sample buffers every so often rather than many
//! tiny chunks constantly:
//!
//! - **Allocation** walks the whole ledger for the smallest free extent that
//!   fits (best fit), splitting off whatever is left over as a new free
//!   extent.
//! - **Freeing** is lazy: the extent is marked free and merged with its
//!   immediate neighbours if they are free, nothing more.
//!
//! ```rust
//! use sound_ram_allocator::SoundRamPool;
//!
//! static POOL: SoundRamPool = SoundRamPool::new();
//!
//! // Keep the first 64 KiB for the sound CPU's program.
//! POOL.init(0x10000).unwrap();
//!
//! let left = POOL.alloc(16 * 1024);
//! let right = POOL.alloc(16 * 1024);
//! assert!(left != 0 && right != 0);
//!
//! POOL.free(left);
//! POOL.free(right);
//! assert_eq!(POOL.available(), 2 * 1024 * 1024 - 0x10000);
//! ```

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod context;
pub mod error;
pub mod ledger;
pub mod pool;

pub use context::{ExecutionContext, InterruptContext, InterruptFlag, ThreadContext};
pub use error::PoolError;
pub use ledger::{Extent, Stats, Validity, ALIGNMENT};
pub use pool::{PoolConfig, SoundRamPool, SOUND_RAM_SIZE};

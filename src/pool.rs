//! The locked sound RAM pool.
//!
//! ## Basic Types
//!
//! ### [`SoundRamPool`](struct.SoundRamPool.html)
//!
//! A `SoundRamPool` wraps an optional [`Ledger`](../ledger/struct.Ledger.html)
//! with a spin lock, making it safe to share between threads and interrupt
//! handlers. The ledger only exists between [`init`](SoundRamPool::init) and
//! [`shutdown`](SoundRamPool::shutdown).
//!
//! ### [`PoolConfig`](struct.PoolConfig.html)
//!
//! How much sound RAM there is, and how many bookkeeping records the pool may
//! create. The default describes the 2 MiB of sound RAM with no record limit.
//!
//! ## Sentinels
//!
//! Offset 0 means "no allocation". [`alloc`](SoundRamPool::alloc) returns it
//! on any failure and [`free`](SoundRamPool::free) ignores it. The `try_`
//! variants report the actual [`PoolError`] instead.

use alloc::vec::Vec;

use log::{debug, error, warn};
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use crate::context::{ExecutionContext, ThreadContext};
use crate::error::PoolError;
use crate::ledger::{align_down, align_up, Extent, Ledger, Stats, Validity, ALIGNMENT};

/// Size of sound RAM, in bytes.
pub const SOUND_RAM_SIZE: u32 = 2 * 1024 * 1024;
const_assert!(SOUND_RAM_SIZE % ALIGNMENT == 0);

/// Static description of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    capacity: u32,
    max_extents: Option<usize>,
}

impl PoolConfig {
    /// The whole of sound RAM, with no limit on bookkeeping records.
    pub const DEFAULT: PoolConfig = PoolConfig {
        capacity: SOUND_RAM_SIZE,
        max_extents: None,
    };

    pub const fn new() -> Self {
        Self::DEFAULT
    }

    /// Manage `bytes` of sound RAM, rounded down to [`ALIGNMENT`].
    pub const fn with_capacity(mut self, bytes: u32) -> Self {
        self.capacity = align_down(bytes);
        self
    }

    /// Never hold more than `records` extents in the ledger. Splits that would
    /// exceed this fail with [`PoolError::OutOfControlMemory`].
    pub const fn with_max_extents(mut self, records: usize) -> Self {
        self.max_extents = Some(records);
        self
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn max_extents(&self) -> Option<usize> {
        self.max_extents
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A thread-safe sound RAM allocator, using a spin lock around a
/// [`Ledger`].
///
/// `C` decides whether a caller may wait for the lock; see
/// [`ExecutionContext`].
pub struct SoundRamPool<C = ThreadContext> {
    config: PoolConfig,
    context: C,
    ledger: Mutex<Option<Ledger>>,
}

impl SoundRamPool<ThreadContext> {
    /// A pool over the whole of sound RAM, used from thread context only.
    ///
    /// The pool starts uninitialized; call [`init`](Self::init) first.
    pub const fn new() -> Self {
        Self::with_context(PoolConfig::DEFAULT, ThreadContext)
    }

    pub const fn with_config(config: PoolConfig) -> Self {
        Self::with_context(config, ThreadContext)
    }
}

impl Default for SoundRamPool<ThreadContext> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SoundRamPool<C> {
    pub const fn with_context(config: PoolConfig, context: C) -> Self {
        SoundRamPool {
            config,
            context,
            ledger: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn context(&self) -> &C {
        &self.context
    }
}

// Get the ledger out of a locked pool, or complain loudly in debug builds.
fn initialized<'a>(
    ledger: &'a mut Option<Ledger>,
    op: &str,
) -> Result<&'a mut Ledger, PoolError> {
    debug_assert!(ledger.is_some(), "use of {} before init", op);
    ledger.as_mut().ok_or(PoolError::UseBeforeInit)
}

// Drop every record, saying what was still in use.
fn dismantle(ledger: Ledger) {
    for extent in &ledger {
        debug!(
            "shutdown: {} block at {:#010x} (size {})",
            if extent.in_use { "in-use" } else { "unused" },
            extent.address,
            extent.size,
        );
    }
}

impl<C: ExecutionContext> SoundRamPool<C> {
    /// Take the ledger lock.
    ///
    /// From thread context this spins until the lock is free. From interrupt
    /// context the current holder may be the very code we interrupted, so the
    /// lock is only tried once.
    fn lock(&self) -> Result<MutexGuard<'_, Option<Ledger>>, PoolError> {
        if self.context.in_interrupt() {
            self.ledger.try_lock().ok_or(PoolError::ResourceBusy)
        } else {
            Ok(self.ledger.lock())
        }
    }

    /// (Re)initialize the pool, leaving everything from `reserve_base` (rounded
    /// up to [`ALIGNMENT`]) to the end of sound RAM free.
    ///
    /// Any previous ledger is discarded first, and with it every offset handed
    /// out so far. On error the pool is left uninitialized.
    pub fn init(&self, reserve_base: u32) -> Result<(), PoolError> {
        let mut guard = self.lock()?;
        if let Some(old) = guard.take() {
            dismantle(old);
        }

        let capacity = self.config.capacity;
        let reserve = align_up(reserve_base)
            .filter(|&reserve| reserve < capacity)
            .ok_or(PoolError::ReserveTooLarge {
                reserve: reserve_base,
                capacity,
            })?;

        let ledger = Ledger::new(reserve, capacity, self.config.max_extents)
            .inspect_err(|err| error!("init: {}", err))?;
        debug!("init: {} bytes available", capacity - reserve);
        *guard = Some(ledger);
        Ok(())
    }

    /// Forget every extent and mark the pool uninitialized. Does nothing if
    /// the pool isn't initialized.
    pub fn shutdown(&self) -> Result<(), PoolError> {
        let mut guard = self.lock()?;
        if let Some(ledger) = guard.take() {
            dismantle(ledger);
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> Result<bool, PoolError> {
        Ok(self.lock()?.is_some())
    }

    /// Allocate at least `size` bytes of sound RAM.
    ///
    /// Returns `Ok(None)` for a zero-sized request, otherwise the offset of the
    /// allocation. The size is rounded up to [`ALIGNMENT`], and the smallest
    /// free extent that fits is used, lowest address first among equals.
    pub fn try_alloc(&self, size: u32) -> Result<Option<u32>, PoolError> {
        let mut guard = self.lock()?;
        let ledger = initialized(&mut guard, "alloc")?;
        if size == 0 {
            return Ok(None);
        }

        let result = match align_up(size) {
            Some(size) => ledger.allocate(size),
            None => Err(PoolError::OutOfSpace {
                requested: size,
                largest: ledger.largest_free(),
            }),
        };
        result
            .map(Some)
            .inspect_err(|err| error!("alloc({}): {}", size, err))
    }

    /// Allocate at least `size` bytes of sound RAM, returning its offset, or 0
    /// if the request was empty or could not be satisfied.
    pub fn alloc(&self, size: u32) -> u32 {
        match self.try_alloc(size) {
            Ok(offset) => offset.unwrap_or(0),
            Err(PoolError::ResourceBusy) => {
                warn!("alloc({}): {}", size, PoolError::ResourceBusy);
                0
            }
            Err(_) => 0,
        }
    }

    /// Give back the allocation starting at `offset`.
    ///
    /// Free neighbours are merged with it immediately. An offset of 0 is
    /// ignored.
    pub fn try_free(&self, offset: u32) -> Result<(), PoolError> {
        let mut guard = self.lock()?;
        let ledger = initialized(&mut guard, "free")?;
        if offset == 0 {
            return Ok(());
        }
        ledger
            .release(offset)
            .inspect_err(|err| error!("free: {}", err))
    }

    /// Give back the allocation starting at `offset`. Unknown or already free
    /// offsets are logged and otherwise ignored.
    pub fn free(&self, offset: u32) {
        if let Err(PoolError::ResourceBusy) = self.try_free(offset) {
            warn!("free({:#010x}): {}", offset, PoolError::ResourceBusy);
        }
    }

    /// Size of the largest single free extent.
    ///
    /// This is the largest allocation that could currently succeed, not the
    /// total number of free bytes. Returns 0 if the pool is uninitialized or
    /// busy.
    pub fn available(&self) -> u32 {
        match self.lock() {
            Ok(guard) => guard.as_ref().map_or(0, Ledger::largest_free),
            Err(_) => 0,
        }
    }

    /// Check the ledger's invariants and gather usage numbers.
    pub fn stats(&self) -> Result<(Validity, Stats), PoolError> {
        let guard = self.lock()?;
        guard
            .as_ref()
            .map(Ledger::stats)
            .ok_or(PoolError::UseBeforeInit)
    }

    /// A copy of every extent, in address order.
    pub fn extents(&self) -> Result<Vec<Extent>, PoolError> {
        let guard = self.lock()?;
        guard
            .as_ref()
            .map(|ledger| ledger.iter().copied().collect())
            .ok_or(PoolError::UseBeforeInit)
    }
}

//! Where is the caller running?
//!
//! The pool needs to know whether it may spin on its lock. A thread can
//! simply wait for the current holder to finish, but an interrupt handler that
//! preempted the holder on the same CPU would wait forever. Pools therefore
//! consult an [`ExecutionContext`] before taking the lock, and only *try* the
//! lock when it reports interrupt context.

use core::sync::atomic::{AtomicBool, Ordering};

pub trait ExecutionContext {
    /// Whether the current caller is running inside an interrupt handler.
    fn in_interrupt(&self) -> bool;
}

/// The caller is always an ordinary thread. Lock acquisition spins.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadContext;

impl ExecutionContext for ThreadContext {
    fn in_interrupt(&self) -> bool {
        false
    }
}

/// The caller is always treated as interrupt context, so every operation
/// fails fast with [`ResourceBusy`](crate::PoolError::ResourceBusy) rather
/// than wait for the lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptContext;

impl ExecutionContext for InterruptContext {
    fn in_interrupt(&self) -> bool {
        true
    }
}

/// A flag an interrupt dispatcher raises on entry and lowers on exit.
///
/// Suitable for single-core targets where "inside an interrupt" is global
/// state.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    inside: AtomicBool,
}

impl InterruptFlag {
    pub const fn new() -> Self {
        InterruptFlag {
            inside: AtomicBool::new(false),
        }
    }

    /// Mark entry into an interrupt handler. Returns the previous state so
    /// nested handlers can restore it.
    pub fn enter(&self) -> bool {
        self.inside.swap(true, Ordering::SeqCst)
    }

    /// Restore the state returned by the matching [`enter`](Self::enter).
    pub fn leave(&self, previous: bool) {
        self.inside.store(previous, Ordering::SeqCst);
    }
}

impl ExecutionContext for InterruptFlag {
    fn in_interrupt(&self) -> bool {
        self.inside.load(Ordering::SeqCst)
    }
}

impl<C: ExecutionContext + ?Sized> ExecutionContext for &C {
    fn in_interrupt(&self) -> bool {
        (**self).in_interrupt()
    }
}

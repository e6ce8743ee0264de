//! Errors reported by [`SoundRamPool`](crate::SoundRamPool).

/// Everything that can go wrong while touching the pool.
///
/// None of these are fatal to the pool itself. A failed `alloc` or `free`
/// leaves the ledger exactly as it was before the call; a failed `init` leaves
/// the pool uninitialized, since the old ledger is discarded first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error, derive_more::IsVariant,
)]
pub enum PoolError {
    /// The ledger lock could not be taken without risking a deadlock. The
    /// caller may retry later.
    #[display("sound RAM pool is busy")]
    ResourceBusy,
    /// No free extent is large enough for the request.
    #[display(
        "no free extent large enough for {requested} bytes (largest free extent is {largest})"
    )]
    OutOfSpace { requested: u32, largest: u32 },
    /// A ledger record could not be created.
    #[display("out of control memory for sound RAM bookkeeping")]
    OutOfControlMemory,
    /// The offset does not start any extent the ledger knows about.
    #[display("attempt to free non-existent block at {offset:#010x}")]
    InvalidFree { offset: u32 },
    /// The pool has not been initialized (or has been shut down).
    #[display("sound RAM pool used before init")]
    UseBeforeInit,
    /// A size or bound handed to the ledger is zero or not a multiple of
    /// [`ALIGNMENT`](crate::ALIGNMENT).
    #[display("{value:#x} is not a non-zero multiple of the sound RAM alignment")]
    Misaligned { value: u32 },
    /// The reserved base leaves nothing to manage.
    #[display("reserved base {reserve:#x} leaves no room in {capacity:#x} bytes of sound RAM")]
    ReserveTooLarge { reserve: u32, capacity: u32 },
}

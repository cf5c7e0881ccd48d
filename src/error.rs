//! Error kinds, grounded on the teacher's `Error<S, P>` shape (spec.md §7).

/// Errors raised by the engine, generic over the HAL's associated error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error<E> {
    /// The state machine reached a tag it has no transition for.
    Internal,
    /// `async_trigger` was called while no operation was in flight.
    BadState,
    /// The busy pre-check found the chip still executing a prior operation.
    HwBusy,
    /// A request arrived while another operation was already in flight.
    Busy,
    /// The erase range does not decompose into supported, aligned blocks.
    EraseUnaligned,
    /// The erase planner chose a block size with no configured opcode.
    BadConfig,
    /// Propagated verbatim from the HAL.
    Hal(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::Hal(e)
    }
}

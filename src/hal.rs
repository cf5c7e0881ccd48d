//! The HAL contract (spec.md §6.1): three operations the engine consumes,
//! satisfied by a capability trait rather than a function-pointer vtable or
//! inheritance (spec.md §9).

/// Three operations a concrete board/BSP must provide.
///
/// Both execution modes share this one trait. In blocking mode, every
/// method runs to completion before returning. In non-blocking mode, a
/// method may return as soon as the action is *queued* — `txrx` as soon as
/// the transfer is handed to DMA, `wait` as soon as a timer is armed — and
/// the implementation is responsible for later calling
/// [`crate::Device::async_trigger`] with the real outcome from whatever
/// context completes it (a SPI-complete ISR, a timer ISR, or a BUSY-line
/// edge handler).
pub trait Hal {
    /// Error type for failed transfers or waits.
    type Error;

    /// Assert (`true`) or deassert (`false`) chip-select. Synchronous in
    /// both execution modes (spec.md §6.1).
    fn cs(&mut self, assert: bool) -> Result<(), Self::Error>;

    /// Transmit `tx` (if non-empty), then receive into `rx` (if non-empty),
    /// on the same CS assertion.
    fn txrx(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;

    /// Delay by `ms` milliseconds. `ms == 0` means "wait until the BUSY pin
    /// indicates ready" rather than "don't wait".
    fn wait(&mut self, ms: u32) -> Result<(), Self::Error>;
}

//! Optional blocking [`Hal`] adapter over `embedded-hal` 1.0 traits
//! (spec.md §6.4 design note).
//!
//! Built on [`SpiBus`] + [`OutputPin`] + [`DelayNs`] rather than
//! `SpiDevice`, because `SpiDevice` owns chip-select management itself and
//! this engine needs `cs` as its own explicit, separately-sequenced
//! micro-state.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::hal::Hal;

/// Wraps a SPI bus, a CS pin and a delay provider into a blocking [`Hal`].
///
/// `cs` is active-low by convention: `cs(true)` drives the pin low.
pub struct EmbeddedHal<SPI, CS, DELAY> {
    spi: SPI,
    cs: CS,
    delay: DELAY,
}

/// Error type for [`EmbeddedHal`], covering the bus, the pin and (for
/// completeness) a delay failure, even though `DelayNs` is infallible.
#[derive(Debug)]
pub enum EmbeddedHalError<SpiE, PinE> {
    Spi(SpiE),
    Pin(PinE),
}

impl<SPI, CS, DELAY> EmbeddedHal<SPI, CS, DELAY>
where
    SPI: SpiBus,
    CS: OutputPin,
    DELAY: DelayNs,
{
    pub fn new(spi: SPI, cs: CS, delay: DELAY) -> Self {
        EmbeddedHal { spi, cs, delay }
    }

    /// Releases the wrapped peripherals.
    pub fn release(self) -> (SPI, CS, DELAY) {
        (self.spi, self.cs, self.delay)
    }
}

impl<SPI, CS, DELAY> Hal for EmbeddedHal<SPI, CS, DELAY>
where
    SPI: SpiBus,
    CS: OutputPin,
    DELAY: DelayNs,
{
    type Error = EmbeddedHalError<SPI::Error, CS::Error>;

    fn cs(&mut self, assert: bool) -> Result<(), Self::Error> {
        if assert {
            self.cs.set_low().map_err(EmbeddedHalError::Pin)
        } else {
            self.cs.set_high().map_err(EmbeddedHalError::Pin)
        }
    }

    fn txrx(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        if !tx.is_empty() {
            self.spi.write(tx).map_err(EmbeddedHalError::Spi)?;
        }
        if !rx.is_empty() {
            self.spi.read(rx).map_err(EmbeddedHalError::Spi)?;
        }
        Ok(())
    }

    fn wait(&mut self, ms: u32) -> Result<(), Self::Error> {
        // `ms == 0` (BUSY-pin mode) has nothing to wait on at this layer;
        // a board that wires BUSY must implement `Hal` directly instead of
        // through this adapter.
        self.delay.delay_ms(ms);
        Ok(())
    }
}

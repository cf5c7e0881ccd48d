//! A hardware-agnostic, dual-mode state machine driver for SPI NOR flash
//! memories.
//!
//! One state machine drives both execution modes: call the public methods
//! on [`Device`] and they run to completion (blocking mode), or stage a
//! request and return immediately, resuming each time you call
//! [`Device::async_trigger`] with the outcome of the last HAL action
//! (non-blocking mode). Both modes share the same per-operation stepping
//! logic in [`engine`]; only the shell around it differs.
//!
//! A concrete chip is described by a [`command::CommandTable`] (opcodes)
//! and a [`command::Config`] (geometry and timing), both borrowed rather
//! than owned so one static description can back several `Device` handles.
//! The board/BSP side is a single [`hal::Hal`] trait implementation.
#![cfg_attr(not(test), no_std)]

mod addr;
mod busy;
mod command;
mod device;
mod engine;
mod erase;
mod error;
mod hal;

#[cfg(feature = "embedded-hal")]
mod hal_impl;

pub use command::{CommandTable, Config, Endianness, ERASE_BLOCK_SIZES, ERASE_SIZE_COUNT};
pub use device::{Device, Mode};
pub use engine::Op;
pub use error::Error;
pub use hal::Hal;

#[cfg(feature = "embedded-hal")]
pub use hal_impl::EmbeddedHal;

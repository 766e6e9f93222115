#![no_std]
//! Interrupt-driven I2C master with DMA data phases.
//!
//! A [`BusController`] owns one I2C peripheral and a pair of DMA channels.
//! Callers submit a [`Transfer`] describing a write, a read, or either one
//! preceded by a short preamble (usually a register pointer); the controller
//! then advances the transaction from the peripheral's event, error and DMA
//! interrupts and reports the outcome exactly once through its
//! [`Completion`].
//!
//! DMA channels are shared with other drivers. They are claimed from a
//! [`DmaArbiter`] when a transaction is admitted and handed back on every
//! terminal path.

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod completion;
mod config;
mod controller;
mod device;
mod dma;
mod error;
mod peripheral;
mod transfer;

pub use completion::{Completion, CompletionHook, Notice, Outcome, TransferId};
pub use config::{Config, DmaPriority, Frequency};
pub use controller::{BusController, Status};
pub use device::I2cDevice;
pub use dma::{
    ChannelId, DmaArbiter, DmaChannel, DmaDirection, DmaFlags, DmaRequest,
};
pub use error::{Error, ErrorKind, SubmitError};
pub use peripheral::{BusEvents, ErrorFlags, I2cPeripheral};
pub use transfer::{Direction, Transfer, MAX_ADDRESS};

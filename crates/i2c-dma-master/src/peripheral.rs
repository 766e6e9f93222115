//! Register-level seam between the controller and one I2C peripheral.
//!
//! The trait mirrors the event/error interrupt split of two-wire master
//! peripherals that hand the data register to DMA: the controller only ever
//! reacts to the flags below and never inspects raw status registers.

use bitflags::bitflags;

use crate::config::Config;
use crate::transfer::Direction;

bitflags! {
    /// Pending protocol events, reported through the bus-event interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusEvents: u8 {
        /// A start (or repeated start) condition was generated.
        const START = 1 << 0;
        /// The addressed peer acknowledged its address.
        const ADDRESSED = 1 << 1;
        /// One byte is ready in the data register.
        const BYTE_RECEIVED = 1 << 2;
    }
}

bitflags! {
    /// Pending fault conditions, reported through the bus-error interrupt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorFlags: u8 {
        const ACK_FAILURE = 1 << 0;
        const ARBITRATION_LOST = 1 << 1;
        const BUS_ERROR = 1 << 2;
        const TIMEOUT = 1 << 3;
        const OVERRUN = 1 << 4;
    }
}

/// One I2C peripheral in master mode.
///
/// Every method is called with the controller's critical section held, so
/// implementations may assume exclusive access to the registers.
pub trait I2cPeripheral {
    /// Program timing and enable the peripheral.
    fn configure(&mut self, config: &Config);

    /// Whether the bus is between a start and a stop condition.
    fn is_busy(&self) -> bool;

    fn events(&self) -> BusEvents;

    fn errors(&self) -> ErrorFlags;

    fn clear_errors(&mut self, flags: ErrorFlags);

    /// Request a start condition. Issued while the bus is held this becomes a
    /// repeated start.
    fn generate_start(&mut self);

    fn generate_stop(&mut self);

    /// Write the address byte. Clears [`BusEvents::START`].
    fn send_address(&mut self, address: u8, direction: Direction);

    /// Acknowledge [`BusEvents::ADDRESSED`], releasing the clock.
    fn clear_address_flag(&mut self);

    /// Enable or disable acknowledge generation for received bytes.
    fn set_ack(&mut self, enabled: bool);

    /// Route data-register requests to the DMA channels.
    fn set_dma_requests(&mut self, enabled: bool);

    /// NACK the byte that completes the current DMA reception.
    fn set_dma_last_transfer(&mut self, enabled: bool);

    /// Raise [`BusEvents::BYTE_RECEIVED`] interrupts.
    fn set_byte_interrupt(&mut self, enabled: bool);

    /// Read the data register. Clears [`BusEvents::BYTE_RECEIVED`].
    fn read_byte(&mut self) -> u8;
}

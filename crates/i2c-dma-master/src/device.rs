//! `embedded-hal` view of a [`BusController`].
//!
//! Drivers written against `embedded_hal::i2c::I2c` or
//! `embedded_hal_async::i2c::I2c` can run on the controller unchanged, as long
//! as each transaction fits one descriptor: a plain write, a plain read, or a
//! short write followed by a write or a read.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::i2c::{ErrorType, Operation};

use crate::controller::BusController;
use crate::dma::{DmaArbiter, DmaChannel};
use crate::error::Error;
use crate::peripheral::I2cPeripheral;
use crate::transfer::Transfer;

/// Borrowing adapter implementing the `embedded-hal` I2C traits.
pub struct I2cDevice<'c, 'a, M, P, D, A>
where
    M: RawMutex,
    A: DmaArbiter + ?Sized,
{
    controller: &'c BusController<'a, M, P, D, A>,
}

impl<'c, 'a, M, P, D, A> I2cDevice<'c, 'a, M, P, D, A>
where
    M: RawMutex,
    A: DmaArbiter + ?Sized,
{
    pub fn new(controller: &'c BusController<'a, M, P, D, A>) -> Self {
        Self { controller }
    }
}

/// Map an operation list onto a single descriptor.
fn describe<'b>(
    address: u8,
    operations: &'b mut [Operation<'_>],
) -> Result<Transfer<'b>, Error> {
    match operations {
        [Operation::Write(data)] => Ok(Transfer::write(address, data)),
        [Operation::Read(buffer)] => Ok(Transfer::read(address, buffer)),
        [Operation::Write(preamble), Operation::Write(data)] => {
            Ok(Transfer::write(address, data).with_preamble(preamble))
        }
        [Operation::Write(preamble), Operation::Read(buffer)] => {
            Ok(Transfer::read(address, buffer).with_preamble(preamble))
        }
        _ => Err(Error::Unsupported),
    }
}

impl<M, P, D, A> ErrorType for I2cDevice<'_, '_, M, P, D, A>
where
    M: RawMutex,
    A: DmaArbiter + ?Sized,
{
    type Error = Error;
}

impl<M, P, D, A> embedded_hal::i2c::I2c for I2cDevice<'_, '_, M, P, D, A>
where
    M: RawMutex,
    P: I2cPeripheral,
    D: DmaChannel,
    A: DmaArbiter + ?Sized,
{
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let transfer = describe(address, operations)?;
        self.controller.transfer_blocking(&transfer)
    }
}

impl<M, P, D, A> embedded_hal_async::i2c::I2c for I2cDevice<'_, '_, M, P, D, A>
where
    M: RawMutex,
    P: I2cPeripheral,
    D: DmaChannel,
    A: DmaArbiter + ?Sized,
{
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let transfer = describe(address, operations)?;
        self.controller.transfer(&transfer).await
    }
}

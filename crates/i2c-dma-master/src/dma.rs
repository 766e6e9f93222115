//! DMA channel handles and the arbitration contract shared with other drivers.

use bitflags::bitflags;

use crate::config::DmaPriority;

/// Numeric id of a hardware DMA channel, as understood by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(pub u8);

bitflags! {
    /// Per-channel interrupt flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u8 {
        const COMPLETE = 1 << 0;
        const ERROR = 1 << 1;
    }
}

/// Which way bytes move between memory and the peripheral data register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    MemoryToPeripheral,
    PeripheralToMemory,
}

/// One programmed DMA transfer.
///
/// `memory` points into a caller-owned [`Transfer`](crate::Transfer) buffer;
/// the controller guarantees it outlives the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    pub memory: *mut u8,
    pub len: usize,
    pub direction: DmaDirection,
    pub priority: DmaPriority,
}

/// A DMA channel wired to the peripheral data register.
pub trait DmaChannel {
    fn id(&self) -> ChannelId;

    /// Program source/destination and length. The channel stays disabled.
    fn configure(&mut self, request: DmaRequest);

    /// Set the run bit.
    fn enable(&mut self);

    /// Clear the run bit.
    fn disable(&mut self);

    fn flags(&self) -> DmaFlags;

    fn clear_flags(&mut self, flags: DmaFlags);
}

/// System-wide DMA channel allocator.
///
/// Implemented outside this crate; every driver that touches a DMA channel
/// must claim it here first.
pub trait DmaArbiter {
    /// Claim `channel` without blocking. Returns `false` if it is held.
    fn try_lock(&self, channel: ChannelId) -> bool;

    /// Give `channel` back.
    fn unlock(&self, channel: ChannelId);
}

/// RAII claim on one DMA channel.
///
/// Dropping the guard unlocks the channel, so a submission that fails halfway
/// through acquisition releases whatever it already took. Once every channel
/// is held, [`commit`](Self::commit) hands ownership to the controller state.
pub(crate) struct ChannelGuard<'a, A: DmaArbiter + ?Sized> {
    arbiter: &'a A,
    channel: ChannelId,
}

impl<'a, A: DmaArbiter + ?Sized> ChannelGuard<'a, A> {
    pub(crate) fn try_acquire(
        arbiter: &'a A,
        channel: ChannelId,
    ) -> Option<Self> {
        if arbiter.try_lock(channel) {
            Some(Self { arbiter, channel })
        } else {
            trace!("dma channel {} busy", channel.0);
            None
        }
    }

    /// Keep the channel locked past the guard's lifetime.
    pub(crate) fn commit(self) {
        core::mem::forget(self);
    }
}

impl<A: DmaArbiter + ?Sized> Drop for ChannelGuard<'_, A> {
    fn drop(&mut self) {
        self.arbiter.unlock(self.channel);
    }
}

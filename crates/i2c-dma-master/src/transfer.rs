//! Transfer descriptors.
//!
//! A [`Transfer`] describes one logical bus operation on caller-owned
//! storage. The controller borrows it for the duration of one transaction and
//! never copies it.

use core::marker::PhantomData;
use core::ptr;

use crate::completion::CompletionHook;
use crate::error::SubmitError;

/// Highest valid 7-bit peer address.
pub const MAX_ADDRESS: u8 = 0x7F;

/// Data direction of the main phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Write,
    Read,
}

/// Descriptor for one bus transaction.
///
/// The optional preamble (typically a register pointer) is always written
/// before the data phase. For reads it is followed by a repeated start.
pub struct Transfer<'a> {
    address: u8,
    direction: Direction,
    preamble_ptr: *const u8,
    preamble_len: usize,
    data_ptr: *mut u8,
    data_len: usize,
    on_complete: Option<CompletionHook>,
    owner_context: *mut (),
    _buffers: PhantomData<&'a mut [u8]>,
}

impl<'a> Transfer<'a> {
    /// Write `data` to the peer at `address`.
    pub fn write(address: u8, data: &'a [u8]) -> Self {
        Self {
            address,
            direction: Direction::Write,
            preamble_ptr: ptr::null(),
            preamble_len: 0,
            // Only ever read through on the write path.
            data_ptr: data.as_ptr() as *mut u8,
            data_len: data.len(),
            on_complete: None,
            owner_context: ptr::null_mut(),
            _buffers: PhantomData,
        }
    }

    /// Fill `buffer` from the peer at `address`.
    pub fn read(address: u8, buffer: &'a mut [u8]) -> Self {
        Self {
            address,
            direction: Direction::Read,
            preamble_ptr: ptr::null(),
            preamble_len: 0,
            data_ptr: buffer.as_mut_ptr(),
            data_len: buffer.len(),
            on_complete: None,
            owner_context: ptr::null_mut(),
            _buffers: PhantomData,
        }
    }

    /// Build a descriptor from raw parts.
    ///
    /// A null `preamble` with `preamble_len == 0` means "no preamble"; any
    /// other combination with a zero or null side is rejected at submission.
    ///
    /// # Safety
    ///
    /// Non-null pointers must be valid for `*_len` bytes (writable for
    /// `data` on reads) for `'a`.
    pub unsafe fn from_raw_parts(
        address: u8,
        direction: Direction,
        preamble: *const u8,
        preamble_len: usize,
        data: *mut u8,
        data_len: usize,
    ) -> Self {
        Self {
            address,
            direction,
            preamble_ptr: preamble,
            preamble_len,
            data_ptr: data,
            data_len,
            on_complete: None,
            owner_context: ptr::null_mut(),
            _buffers: PhantomData,
        }
    }

    /// Send `preamble` before the data phase.
    pub fn with_preamble(mut self, preamble: &'a [u8]) -> Self {
        self.preamble_ptr = preamble.as_ptr();
        self.preamble_len = preamble.len();
        self
    }

    /// Hook fired instead of the controller's hook when this transfer ends.
    pub fn with_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Opaque pointer handed back in the completion [`Notice`](crate::Notice).
    pub fn with_context(mut self, context: *mut ()) -> Self {
        self.owner_context = context;
        self
    }

    /// 7-bit peer address.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn has_preamble(&self) -> bool {
        !self.preamble_ptr.is_null()
    }

    /// Length of the data phase in bytes.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn owner_context(&self) -> *mut () {
        self.owner_context
    }

    pub(crate) fn on_complete(&self) -> Option<CompletionHook> {
        self.on_complete
    }

    pub(crate) fn preamble_raw(&self) -> (*const u8, usize) {
        (self.preamble_ptr, self.preamble_len)
    }

    pub(crate) fn data_raw(&self) -> (*mut u8, usize) {
        (self.data_ptr, self.data_len)
    }

    /// Check the descriptor without touching any controller state.
    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.address > MAX_ADDRESS {
            return Err(SubmitError::InvalidValue);
        }
        if self.data_ptr.is_null() || self.data_len == 0 {
            return Err(SubmitError::InvalidValue);
        }
        if self.preamble_ptr.is_null() != (self.preamble_len == 0) {
            return Err(SubmitError::InvalidValue);
        }
        Ok(())
    }
}

impl core::fmt::Debug for Transfer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transfer")
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("preamble_len", &self.preamble_len)
            .field("data_len", &self.data_len)
            .finish()
    }
}

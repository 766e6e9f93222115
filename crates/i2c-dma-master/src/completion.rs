//! Single-slot completion cell.
//!
//! Every transaction ends with exactly one call to [`Completion::notify`].
//! Callers observe it in whichever way suits their context: polling the
//! slot, spinning on it, awaiting it, or subscribing a hook that runs in the
//! interrupt that finished the transaction.

use core::cell::Cell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::AtomicWaker;
use portable_atomic::{AtomicU32, AtomicU8, Ordering};

use crate::error::ErrorKind;

/// Completion callback. Runs in interrupt context: keep it short, never block.
pub type CompletionHook = fn(&Notice);

/// Caller-chosen tag identifying which client owns the transaction in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(pub u32);

/// Terminal result of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Written,
    Read,
    Failed(ErrorKind),
}

impl Outcome {
    pub fn into_result(self) -> Result<(), ErrorKind> {
        match self {
            Outcome::Written | Outcome::Read => Ok(()),
            Outcome::Failed(kind) => Err(kind),
        }
    }
}

/// What a [`CompletionHook`] is told.
#[derive(Debug, Clone, Copy)]
pub struct Notice {
    pub outcome: Outcome,
    /// The controller's transfer id at completion time.
    pub transfer_id: TransferId,
    /// The descriptor's owner context.
    pub context: *mut (),
}

const EMPTY: u8 = 0;
const WRITTEN: u8 = 1;
const READ: u8 = 2;
const FAILED: u8 = 0x10;

fn encode(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Written => WRITTEN,
        Outcome::Read => READ,
        Outcome::Failed(kind) => {
            FAILED
                | match kind {
                    ErrorKind::Nack => 0,
                    ErrorKind::ArbitrationLost => 1,
                    ErrorKind::BusFault => 2,
                    ErrorKind::Timeout => 3,
                    ErrorKind::Overrun => 4,
                    ErrorKind::DmaFault => 5,
                    ErrorKind::Unknown => 6,
                }
        }
    }
}

fn decode(raw: u8) -> Option<Outcome> {
    let kind = match raw {
        EMPTY => return None,
        WRITTEN => return Some(Outcome::Written),
        READ => return Some(Outcome::Read),
        0x10 => ErrorKind::Nack,
        0x11 => ErrorKind::ArbitrationLost,
        0x12 => ErrorKind::BusFault,
        0x13 => ErrorKind::Timeout,
        0x14 => ErrorKind::Overrun,
        0x15 => ErrorKind::DmaFault,
        _ => ErrorKind::Unknown,
    };
    Some(Outcome::Failed(kind))
}

/// Notifications remembered for late waiters.
const HISTORY: usize = 4;

/// Sequence bits kept in a history entry, above the outcome byte.
const TAG_MASK: u32 = 0x00FF_FFFF;

/// Single-slot result cell with poll, block, await and subscribe accessors.
pub struct Completion<M: RawMutex> {
    outcome: AtomicU8,
    sequence: AtomicU32,
    /// `sequence << 8 | outcome` of recent notifications, indexed by
    /// sequence. Unlike `outcome` it is not cleared by the next submission.
    history: [AtomicU32; HISTORY],
    waker: AtomicWaker,
    hook: Mutex<M, Cell<Option<CompletionHook>>>,
}

impl<M: RawMutex> Completion<M> {
    pub const fn new() -> Self {
        Self {
            outcome: AtomicU8::new(EMPTY),
            sequence: AtomicU32::new(0),
            history: [const { AtomicU32::new(0) }; HISTORY],
            waker: AtomicWaker::new(),
            hook: Mutex::new(Cell::new(None)),
        }
    }

    /// Outcome of the last finished transaction, `None` while one is in
    /// flight or before the first one ends.
    pub fn poll(&self) -> Option<Outcome> {
        decode(self.outcome.load(Ordering::Acquire))
    }

    /// Number of notifications delivered so far.
    ///
    /// A value read here only identifies a specific submission if nothing
    /// else can submit in between; the controller's transfer helpers capture
    /// it inside the submission's critical section.
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Spin until the first notification after `since` arrives.
    pub fn wait_blocking(&self, since: u32) -> Outcome {
        loop {
            if let Some(outcome) = self.newer_than(since) {
                return outcome;
            }
            core::hint::spin_loop();
        }
    }

    /// Wait for the first notification after `since`.
    pub async fn wait(&self, since: u32) -> Outcome {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.newer_than(since) {
                Some(outcome) => Poll::Ready(outcome),
                None => Poll::Pending,
            }
        })
        .await
    }

    /// Outcome of notification `since + 1`, once it has been delivered.
    fn newer_than(&self, since: u32) -> Option<Outcome> {
        if self.sequence() == since {
            return None;
        }
        let target = since.wrapping_add(1);
        let slot = &self.history[target as usize % HISTORY];
        let entry = slot.load(Ordering::Acquire);
        if entry >> 8 == target & TAG_MASK {
            if let Some(outcome) = decode(entry as u8) {
                return Some(outcome);
            }
        }
        // Overwritten by later notifications: the transaction has long
        // ended but its outcome is gone.
        Some(Outcome::Failed(ErrorKind::Unknown))
    }

    pub(crate) fn subscribe(&self, hook: Option<CompletionHook>) {
        self.hook.lock(|cell| cell.set(hook));
    }

    /// Empty the slot for a newly admitted transaction.
    pub(crate) fn arm(&self) {
        self.outcome.store(EMPTY, Ordering::Release);
    }

    /// Publish `notice` and run exactly one hook: the descriptor's if it has
    /// one, otherwise the subscribed one. Runs inside the controller's
    /// critical section, so notifications never interleave.
    pub(crate) fn notify(
        &self,
        notice: &Notice,
        descriptor_hook: Option<CompletionHook>,
    ) {
        let code = encode(notice.outcome);
        let sequence = self.sequence().wrapping_add(1);
        let entry = ((sequence & TAG_MASK) << 8) | code as u32;
        self.history[sequence as usize % HISTORY]
            .store(entry, Ordering::Release);
        self.outcome.store(code, Ordering::Release);
        self.sequence.store(sequence, Ordering::Release);

        let hook =
            descriptor_hook.or_else(|| self.hook.lock(|cell| cell.get()));
        if let Some(hook) = hook {
            hook(notice);
        }
        self.waker.wake();
    }
}

impl<M: RawMutex> Default for Completion<M> {
    fn default() -> Self {
        Self::new()
    }
}

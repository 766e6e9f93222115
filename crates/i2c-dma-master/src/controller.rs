use core::cell::RefCell;
use core::ptr::NonNull;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::completion::{
    Completion, CompletionHook, Notice, Outcome, TransferId,
};
use crate::config::Config;
use crate::dma::{
    ChannelGuard, DmaArbiter, DmaChannel, DmaDirection, DmaFlags, DmaRequest,
};
use crate::error::{Error, ErrorKind, SubmitError};
use crate::peripheral::{BusEvents, I2cPeripheral};
use crate::transfer::{Direction, Transfer};

/// Caller-visible controller status.
///
/// `Writing` and `Reading` are only observed while a transaction is in
/// flight; the other values are stable between transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Idle,
    Writing,
    Reading,
    Written,
    Read,
    Error,
}

/// Protocol sub-state driving interrupt dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Phase {
    Idle,
    SendingPreamble,
    SendingData,
    Receiving,
}

/// Everything an interrupt may touch. Lives behind the controller's
/// critical section.
struct Inner<P, D> {
    peripheral: P,
    tx: D,
    rx: D,
    config: Config,
    status: Status,
    last_error: Option<ErrorKind>,
    phase: Phase,
    tx_locked: bool,
    rx_locked: bool,
    transfer_id: TransferId,
    /// Descriptor of the transaction in flight, `Some` iff `phase != Idle`.
    active: Option<NonNull<Transfer<'static>>>,
}

// SAFETY: `active` is only dereferenced inside the critical section, and the
// submitter guarantees the descriptor outlives the transaction.
unsafe impl<P: Send, D: Send> Send for Inner<P, D> {}

/// Result of running one interrupt entry point against the state.
enum Dispatch {
    NotMine,
    Handled,
    Finished(Finished),
}

/// Notification owed after a terminal transition.
struct Finished {
    notice: Notice,
    hook: Option<CompletionHook>,
}

impl<P: I2cPeripheral, D: DmaChannel> Inner<P, D> {
    /// The descriptor in flight.
    fn active<'t>(&self) -> Option<&'t Transfer<'static>> {
        // SAFETY: `submit` obliges the caller to keep the descriptor valid and
        // unmodified until completion, and `finish` clears `active` before
        // completion is reported.
        self.active.map(|transfer| unsafe { transfer.as_ref() })
    }

    fn dma_request(
        &self,
        memory: *mut u8,
        len: usize,
        direction: DmaDirection,
    ) -> DmaRequest {
        DmaRequest {
            memory,
            len,
            direction,
            priority: self.config.dma_priority,
        }
    }

    fn start_tx(&mut self, memory: *const u8, len: usize) {
        let direction = DmaDirection::MemoryToPeripheral;
        let request = self.dma_request(memory as *mut u8, len, direction);
        self.tx.configure(request);
        self.peripheral.set_dma_requests(true);
        self.tx.enable();
    }

    fn bus_event<A: DmaArbiter + ?Sized>(&mut self, arbiter: &A) -> Dispatch {
        if self.phase == Phase::Idle {
            return Dispatch::NotMine;
        }
        let Some(transfer) = self.active() else {
            return Dispatch::NotMine;
        };
        let events = self.peripheral.events();

        if events.contains(BusEvents::START) {
            let direction = match self.phase {
                Phase::Receiving => Direction::Read,
                _ => Direction::Write,
            };
            trace!(
                "start accepted, addressing {=u8:#x} ({})",
                transfer.address(),
                direction
            );
            self.peripheral.send_address(transfer.address(), direction);
            return Dispatch::Handled;
        }

        if events.contains(BusEvents::ADDRESSED) {
            trace!(
                "{=u8:#x} acknowledged in {}",
                transfer.address(),
                self.phase
            );
            match self.phase {
                Phase::SendingPreamble => {
                    let (preamble, len) = transfer.preamble_raw();
                    self.start_tx(preamble, len);
                }
                Phase::SendingData => {
                    let (data, len) = transfer.data_raw();
                    self.start_tx(data, len);
                }
                Phase::Receiving if transfer.data_len() == 1 => {
                    // NACK must be armed before the address flag is released,
                    // and the stop follows immediately.
                    self.peripheral.set_ack(false);
                    self.peripheral.clear_address_flag();
                    self.peripheral.generate_stop();
                    self.peripheral.set_byte_interrupt(true);
                    return Dispatch::Handled;
                }
                Phase::Receiving => {
                    let (data, len) = transfer.data_raw();
                    let direction = DmaDirection::PeripheralToMemory;
                    let request = self.dma_request(data, len, direction);
                    self.rx.configure(request);
                    self.peripheral.set_ack(true);
                    self.peripheral.set_dma_last_transfer(true);
                    self.peripheral.set_dma_requests(true);
                    self.rx.enable();
                }
                Phase::Idle => return Dispatch::NotMine,
            }
            self.peripheral.clear_address_flag();
            return Dispatch::Handled;
        }

        // A byte flag during a DMA reception belongs to the rx channel.
        let byte_mode = self.phase == Phase::Receiving
            && !self.rx_locked
            && transfer.data_len() == 1;
        if events.contains(BusEvents::BYTE_RECEIVED) && byte_mode {
            let byte = self.peripheral.read_byte();
            let (data, _) = transfer.data_raw();
            // SAFETY: validated non-null with length 1, writable for the
            // duration of the transaction.
            unsafe { data.write(byte) };
            self.peripheral.set_byte_interrupt(false);
            self.peripheral.set_ack(true);
            return Dispatch::Finished(self.finish(Outcome::Read, arbiter));
        }

        Dispatch::NotMine
    }

    fn bus_error<A: DmaArbiter + ?Sized>(&mut self, arbiter: &A) -> Dispatch {
        let flags = self.peripheral.errors();
        self.peripheral.clear_errors(flags);
        if self.phase == Phase::Idle {
            warn!(
                "bus error {=u8:#x} with no transfer in flight",
                flags.bits()
            );
            return Dispatch::NotMine;
        }
        Dispatch::Finished(self.fault(ErrorKind::classify(flags), arbiter))
    }

    fn dma_tx<A: DmaArbiter + ?Sized>(&mut self, arbiter: &A) -> Dispatch {
        let sending = matches!(
            self.phase,
            Phase::SendingPreamble | Phase::SendingData
        );
        if !self.tx_locked || !sending {
            return Dispatch::NotMine;
        }
        let flags = self.tx.flags();
        self.tx.clear_flags(flags);
        if flags.contains(DmaFlags::ERROR) {
            return Dispatch::Finished(self.fault(ErrorKind::DmaFault, arbiter));
        }
        if !flags.contains(DmaFlags::COMPLETE) {
            return Dispatch::Handled;
        }
        let Some(transfer) = self.active() else {
            return Dispatch::NotMine;
        };

        self.tx.disable();
        match (self.phase, transfer.direction()) {
            (Phase::SendingPreamble, Direction::Write) => {
                let (data, len) = transfer.data_raw();
                let direction = DmaDirection::MemoryToPeripheral;
                let request = self.dma_request(data, len, direction);
                self.tx.configure(request);
                self.tx.enable();
                self.phase = Phase::SendingData;
                Dispatch::Handled
            }
            (Phase::SendingPreamble, Direction::Read) => {
                self.peripheral.set_dma_requests(false);
                self.release_tx(arbiter);
                self.phase = Phase::Receiving;
                self.peripheral.generate_start();
                Dispatch::Handled
            }
            _ => {
                self.peripheral.set_dma_requests(false);
                self.peripheral.generate_stop();
                Dispatch::Finished(self.finish(Outcome::Written, arbiter))
            }
        }
    }

    fn dma_rx<A: DmaArbiter + ?Sized>(&mut self, arbiter: &A) -> Dispatch {
        if !self.rx_locked || self.phase != Phase::Receiving {
            return Dispatch::NotMine;
        }
        let flags = self.rx.flags();
        self.rx.clear_flags(flags);
        if flags.contains(DmaFlags::ERROR) {
            return Dispatch::Finished(self.fault(ErrorKind::DmaFault, arbiter));
        }
        if !flags.contains(DmaFlags::COMPLETE) {
            return Dispatch::Handled;
        }

        self.rx.disable();
        self.peripheral.set_dma_requests(false);
        self.peripheral.set_dma_last_transfer(false);
        self.peripheral.generate_stop();
        Dispatch::Finished(self.finish(Outcome::Read, arbiter))
    }

    /// Tear down a failed transaction.
    fn fault<A: DmaArbiter + ?Sized>(
        &mut self,
        kind: ErrorKind,
        arbiter: &A,
    ) -> Finished {
        warn!("transfer failed in {}: {}", self.phase, kind);
        self.peripheral.set_dma_requests(false);
        self.peripheral.set_dma_last_transfer(false);
        self.peripheral.set_byte_interrupt(false);
        if self.tx_locked {
            self.tx.disable();
        }
        if self.rx_locked {
            self.rx.disable();
        }
        // Other faults may have already broken bus timing.
        if kind == ErrorKind::Nack {
            self.peripheral.generate_stop();
        }
        self.peripheral.set_ack(true);
        self.finish(Outcome::Failed(kind), arbiter)
    }

    /// Terminal transition shared by every exit path.
    fn finish<A: DmaArbiter + ?Sized>(
        &mut self,
        outcome: Outcome,
        arbiter: &A,
    ) -> Finished {
        self.release_tx(arbiter);
        self.release_rx(arbiter);
        self.status = match outcome {
            Outcome::Written => Status::Written,
            Outcome::Read => Status::Read,
            Outcome::Failed(_) => Status::Error,
        };
        self.last_error = match outcome {
            Outcome::Failed(kind) => Some(kind),
            _ => None,
        };
        self.phase = Phase::Idle;

        let transfer = self.active();
        self.active = None;
        debug!("transfer {=u32} finished: {}", self.transfer_id.0, outcome);
        Finished {
            notice: Notice {
                outcome,
                transfer_id: self.transfer_id,
                context: transfer
                    .map_or(core::ptr::null_mut(), Transfer::owner_context),
            },
            hook: transfer.and_then(Transfer::on_complete),
        }
    }

    fn release_tx<A: DmaArbiter + ?Sized>(&mut self, arbiter: &A) {
        if self.tx_locked {
            arbiter.unlock(self.tx.id());
            self.tx_locked = false;
        }
    }

    fn release_rx<A: DmaArbiter + ?Sized>(&mut self, arbiter: &A) {
        if self.rx_locked {
            arbiter.unlock(self.rx.id());
            self.rx_locked = false;
        }
    }
}

/// Interrupt-driven master for one I2C bus.
///
/// One instance per physical bus, usually in a `static`. The platform routes
/// the peripheral's event and error interrupts and both DMA channel
/// interrupts to the `on_*` entry points. Every entry point and
/// [`submit`](Self::submit) runs inside one critical section of `M`, so the
/// busy check and the lock state always change together.
pub struct BusController<'a, M, P, D, A>
where
    M: RawMutex,
    A: DmaArbiter + ?Sized,
{
    state: Mutex<M, RefCell<Inner<P, D>>>,
    arbiter: &'a A,
    completion: Completion<M>,
}

impl<'a, M, P, D, A> BusController<'a, M, P, D, A>
where
    M: RawMutex,
    P: I2cPeripheral,
    D: DmaChannel,
    A: DmaArbiter + ?Sized,
{
    /// Bind a peripheral and its tx/rx DMA channels.
    pub const fn new(peripheral: P, tx: D, rx: D, arbiter: &'a A) -> Self {
        Self {
            state: Mutex::new(RefCell::new(Inner {
                peripheral,
                tx,
                rx,
                config: Config::new(),
                status: Status::Idle,
                last_error: None,
                phase: Phase::Idle,
                tx_locked: false,
                rx_locked: false,
                transfer_id: TransferId(0),
                active: None,
            })),
            arbiter,
            completion: Completion::new(),
        }
    }

    /// Apply `config` to the peripheral. Rejected while a transfer is in
    /// flight.
    pub fn init(&self, config: Config) -> Result<(), SubmitError> {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.phase != Phase::Idle {
                return Err(SubmitError::Busy);
            }
            state.peripheral.configure(&config);
            state.config = config;
            debug!("i2c configured at {=u32} Hz", config.frequency.hz());
            Ok(())
        })
    }

    /// Start writing `transfer`.
    ///
    /// # Safety
    ///
    /// `transfer` and the buffers it points to must stay valid and unmodified
    /// until the controller is idle again.
    pub unsafe fn submit_write(
        &self,
        transfer: &Transfer<'_>,
    ) -> Result<(), SubmitError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.submit(transfer, Direction::Write) }
    }

    /// Start reading into `transfer`.
    ///
    /// # Safety
    ///
    /// See [`submit_write`](Self::submit_write).
    pub unsafe fn submit_read(
        &self,
        transfer: &Transfer<'_>,
    ) -> Result<(), SubmitError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.submit(transfer, Direction::Read) }
    }

    /// Validate `transfer`, claim its DMA channels and issue a start
    /// condition. Returns as soon as the start is requested.
    ///
    /// # Safety
    ///
    /// See [`submit_write`](Self::submit_write).
    pub unsafe fn submit(
        &self,
        transfer: &Transfer<'_>,
        direction: Direction,
    ) -> Result<(), SubmitError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.admit(transfer, direction) }?;
        Ok(())
    }

    /// Admit `transfer` and return the completion sequence it will be
    /// reported after. Both happen in one critical section, so no other
    /// notification can slip in between.
    ///
    /// # Safety
    ///
    /// See [`submit_write`](Self::submit_write).
    unsafe fn admit(
        &self,
        transfer: &Transfer<'_>,
        direction: Direction,
    ) -> Result<u32, SubmitError> {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.phase != Phase::Idle {
                return Err(SubmitError::Busy);
            }
            transfer.validate()?;
            if transfer.direction() != direction {
                return Err(SubmitError::InvalidValue);
            }

            // Single-byte reads are finished from the event interrupt.
            let needs_tx =
                direction == Direction::Write || transfer.has_preamble();
            let needs_rx =
                direction == Direction::Read && transfer.data_len() > 1;

            let tx = if needs_tx {
                let guard =
                    ChannelGuard::try_acquire(self.arbiter, state.tx.id());
                Some(guard.ok_or(SubmitError::Busy)?)
            } else {
                None
            };
            // A failure here drops `tx`, which unlocks it again.
            let rx = if needs_rx {
                let guard =
                    ChannelGuard::try_acquire(self.arbiter, state.rx.id());
                Some(guard.ok_or(SubmitError::Busy)?)
            } else {
                None
            };
            state.tx_locked = tx.is_some();
            state.rx_locked = rx.is_some();
            tx.into_iter().chain(rx).for_each(ChannelGuard::commit);

            state.active = Some(NonNull::from(transfer).cast());
            state.last_error = None;
            state.status = match direction {
                Direction::Write => Status::Writing,
                Direction::Read => Status::Reading,
            };
            state.phase = match direction {
                _ if transfer.has_preamble() => Phase::SendingPreamble,
                Direction::Write => Phase::SendingData,
                Direction::Read => Phase::Receiving,
            };
            trace!(
                "submit {=u8:#x} {} {=usize} bytes, phase {}",
                transfer.address(),
                direction,
                transfer.data_len(),
                state.phase
            );
            let since = self.completion.sequence();
            self.completion.arm();
            state.peripheral.generate_start();
            Ok(since)
        })
    }

    /// Bus event interrupt entry point.
    pub fn on_bus_event(&self) -> bool {
        self.dispatch(|state, arbiter| state.bus_event(arbiter))
    }

    /// Bus error interrupt entry point.
    pub fn on_bus_error(&self) -> bool {
        self.dispatch(|state, arbiter| state.bus_error(arbiter))
    }

    /// Tx DMA channel interrupt entry point. Returns `false` when this
    /// controller does not currently own the channel.
    pub fn on_dma_tx(&self) -> bool {
        self.dispatch(|state, arbiter| state.dma_tx(arbiter))
    }

    /// Rx DMA channel interrupt entry point. Returns `false` when this
    /// controller does not currently own the channel.
    pub fn on_dma_rx(&self) -> bool {
        self.dispatch(|state, arbiter| state.dma_rx(arbiter))
    }

    fn dispatch(
        &self,
        f: impl FnOnce(&mut Inner<P, D>, &A) -> Dispatch,
    ) -> bool {
        self.state.lock(|cell| {
            // The borrow ends before the hook runs so it may query the
            // controller or submit the next transfer.
            let dispatch = f(&mut *cell.borrow_mut(), self.arbiter);
            match dispatch {
                Dispatch::NotMine => false,
                Dispatch::Handled => true,
                Dispatch::Finished(finished) => {
                    self.completion.notify(&finished.notice, finished.hook);
                    true
                }
            }
        })
    }

    /// Coarse status of the current or last transaction.
    pub fn status(&self) -> Status {
        self.state.lock(|cell| cell.borrow().status)
    }

    /// Why the last transaction failed. `None` unless status is `Error`.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.state.lock(|cell| {
            let state = cell.borrow();
            match state.status {
                Status::Error => state.last_error,
                _ => None,
            }
        })
    }

    /// Whether no transaction is in flight.
    pub fn is_idle(&self) -> bool {
        self.state.lock(|cell| cell.borrow().phase == Phase::Idle)
    }

    /// Whether the peripheral still holds the bus.
    pub fn hardware_busy(&self) -> bool {
        self.state.lock(|cell| cell.borrow().peripheral.is_busy())
    }

    /// Whether the tx DMA channel is currently locked by this controller.
    pub fn holds_tx_channel(&self) -> bool {
        self.state.lock(|cell| cell.borrow().tx_locked)
    }

    /// Whether the rx DMA channel is currently locked by this controller.
    pub fn holds_rx_channel(&self) -> bool {
        self.state.lock(|cell| cell.borrow().rx_locked)
    }

    /// Tag reported with the next completion.
    pub fn transfer_id(&self) -> TransferId {
        self.state.lock(|cell| cell.borrow().transfer_id)
    }

    /// Tag subsequent completions. Rejected while a transfer is in flight.
    pub fn set_transfer_id(&self, id: TransferId) -> Result<(), SubmitError> {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.phase != Phase::Idle {
                return Err(SubmitError::Busy);
            }
            state.transfer_id = id;
            Ok(())
        })
    }

    /// Register or replace the completion hook used by transfers without
    /// their own. Rejected while a transfer is in flight.
    pub fn set_hook(
        &self,
        hook: Option<CompletionHook>,
    ) -> Result<(), SubmitError> {
        self.state.lock(|cell| {
            if cell.borrow().phase != Phase::Idle {
                return Err(SubmitError::Busy);
            }
            self.completion.subscribe(hook);
            Ok(())
        })
    }

    /// Completion cell for polling, spinning on or awaiting outcomes.
    pub fn completion(&self) -> &Completion<M> {
        &self.completion
    }

    /// Spin until no transaction is in flight and the bus is released.
    /// There is no timeout.
    pub fn wait(&self) {
        while !self.is_idle() || self.hardware_busy() {
            core::hint::spin_loop();
        }
    }

    /// Run `transfer` to completion, spinning while it is in flight.
    pub fn transfer_blocking(
        &self,
        transfer: &Transfer<'_>,
    ) -> Result<(), Error> {
        // SAFETY: `transfer` stays borrowed until `wait` observes the
        // controller idle, after which it holds no reference to it.
        let since = unsafe { self.admit(transfer, transfer.direction())? };
        self.wait();
        Ok(self.completion.wait_blocking(since).into_result()?)
    }

    /// Run `transfer` to completion, yielding while it is in flight.
    ///
    /// Dropping the future mid-transaction blocks until the hardware is done
    /// with the buffers.
    pub async fn transfer(&self, transfer: &Transfer<'_>) -> Result<(), Error> {
        // SAFETY: the guard below keeps `transfer` borrowed until the
        // controller is idle, even if this future is dropped early.
        let since = unsafe { self.admit(transfer, transfer.direction())? };
        let guard = OnDrop::new(|| self.wait());
        let outcome = self.completion.wait(since).await;
        guard.defuse();
        Ok(outcome.into_result()?)
    }
}

struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    fn new(f: F) -> Self {
        Self(Some(f))
    }

    fn defuse(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

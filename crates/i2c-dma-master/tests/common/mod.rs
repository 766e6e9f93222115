#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use embassy_sync::blocking_mutex::raw::RawMutex;
use i2c_dma_master::{
    BusController, BusEvents, ChannelId, Config, Direction, DmaArbiter,
    DmaChannel, DmaDirection, DmaFlags, DmaPriority, DmaRequest, ErrorFlags,
    I2cPeripheral, Notice, Outcome, TransferId,
};

pub const TX_CHANNEL: ChannelId = ChannelId(6);
pub const RX_CHANNEL: ChannelId = ChannelId(5);

pub type Controller<M> =
    BusController<'static, M, SimPeripheral, SimDma, SimArbiter>;

// ---------------------------------------------------------------------------
// Simulated bus
// ---------------------------------------------------------------------------

/// Observable bus activity, in the order the hardware performed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Start,
    RepeatedStart,
    Address { address: u8, read: bool },
    TxDma { bytes: Vec<u8> },
    RxDma { len: usize, auto_nack: bool },
    ByteRead,
    Stop,
}

struct Channel {
    // Pointers are kept as integers so the state stays `Send`.
    memory: usize,
    len: usize,
    direction: Option<DmaDirection>,
    priority: Option<DmaPriority>,
    enabled: bool,
    ran: bool,
    flags: DmaFlags,
    fail_next: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            memory: 0,
            len: 0,
            direction: None,
            priority: None,
            enabled: false,
            ran: false,
            flags: DmaFlags::empty(),
            fail_next: false,
        }
    }
}

struct SimState {
    peer_address: u8,
    response: Vec<u8>,
    cursor: usize,
    written: Vec<u8>,
    trace: Vec<Trace>,
    configured: Option<Config>,

    busy: bool,
    start_pending: bool,
    addressed: bool,
    read_mode: bool,
    single_read_pending: bool,
    byte_ready: Option<u8>,
    errors: ErrorFlags,
    ack: bool,
    dma_requests: bool,
    dma_last: bool,
    byte_irq: bool,

    tx: Channel,
    rx: Channel,
}

impl SimState {
    fn next_byte(&mut self) -> u8 {
        let byte = self.response.get(self.cursor).copied().unwrap_or(0xFF);
        self.cursor += 1;
        byte
    }

    fn channel(&mut self, which: Which) -> &mut Channel {
        match which {
            Which::Tx => &mut self.tx,
            Which::Rx => &mut self.rx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Tx,
    Rx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Irq {
    Error,
    Event,
    DmaTx,
    DmaRx,
}

/// A master peripheral, two DMA channels and one peer that answers at
/// `peer_address`. Every other address is not acknowledged.
#[derive(Clone)]
pub struct Sim {
    state: Arc<Mutex<SimState>>,
}

impl Sim {
    pub fn new(peer_address: u8, response: &[u8]) -> Self {
        let state = SimState {
            peer_address,
            response: response.to_vec(),
            cursor: 0,
            written: Vec::new(),
            trace: Vec::new(),
            configured: None,
            busy: false,
            start_pending: false,
            addressed: false,
            read_mode: false,
            single_read_pending: false,
            byte_ready: None,
            errors: ErrorFlags::empty(),
            ack: true,
            dma_requests: false,
            dma_last: false,
            byte_irq: false,
            tx: Channel::new(),
            rx: Channel::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn peripheral(&self) -> SimPeripheral {
        SimPeripheral(self.clone())
    }

    pub fn dma(&self, which: Which) -> SimDma {
        SimDma { sim: self.clone(), which }
    }

    pub fn trace(&self) -> Vec<Trace> {
        self.with(|s| s.trace.clone())
    }

    /// Bytes the peer received, across all transactions.
    pub fn written(&self) -> Vec<u8> {
        self.with(|s| s.written.clone())
    }

    pub fn configured(&self) -> Option<Config> {
        self.with(|s| s.configured)
    }

    pub fn is_busy(&self) -> bool {
        self.with(|s| s.busy)
    }

    pub fn tx_priority(&self) -> Option<DmaPriority> {
        self.with(|s| s.tx.priority)
    }

    pub fn tx_enabled(&self) -> bool {
        self.with(|s| s.tx.enabled)
    }

    pub fn rx_enabled(&self) -> bool {
        self.with(|s| s.rx.enabled)
    }

    pub fn dma_requests_enabled(&self) -> bool {
        self.with(|s| s.dma_requests)
    }

    pub fn dma_last_enabled(&self) -> bool {
        self.with(|s| s.dma_last)
    }

    pub fn byte_irq_enabled(&self) -> bool {
        self.with(|s| s.byte_irq)
    }

    pub fn ack_enabled(&self) -> bool {
        self.with(|s| s.ack)
    }

    /// Raise error flags as the peripheral would. Losing arbitration also
    /// drops the bus, like real hardware falling back to slave mode.
    pub fn inject_error(&self, flags: ErrorFlags) {
        self.with(|s| {
            s.errors.insert(flags);
            if flags.contains(ErrorFlags::ARBITRATION_LOST) {
                s.busy = false;
                s.start_pending = false;
            }
        })
    }

    /// Make the next tx DMA run end in a transfer error.
    pub fn fail_next_tx_dma(&self) {
        self.with(|s| s.tx.fail_next = true)
    }

    /// Make the next rx DMA run end in a transfer error.
    pub fn fail_next_rx_dma(&self) {
        self.with(|s| s.rx.fail_next = true)
    }

    /// Leave `byte` in the data register, as seen just before DMA picks it
    /// up.
    pub fn latch_byte(&self, byte: u8) {
        self.with(|s| s.byte_ready = Some(byte))
    }

    /// Drop a latched byte, as the rx DMA request would.
    pub fn consume_latched_byte(&self) {
        self.with(|s| s.byte_ready = None)
    }

    /// Advance the hardware: run armed DMA channels and latch single-byte
    /// receptions.
    fn step(&self) {
        self.with(|s| {
            if s.single_read_pending {
                s.single_read_pending = false;
                let byte = s.next_byte();
                s.byte_ready = Some(byte);
            }
            // The clock is stretched until the address flag is cleared.
            if !s.dma_requests || s.addressed {
                return;
            }
            if s.tx.enabled && !s.tx.ran {
                s.tx.ran = true;
                if std::mem::take(&mut s.tx.fail_next) {
                    s.tx.flags.insert(DmaFlags::ERROR);
                } else {
                    let memory = s.tx.memory as *const u8;
                    let bytes =
                        unsafe { std::slice::from_raw_parts(memory, s.tx.len) }
                            .to_vec();
                    s.written.extend_from_slice(&bytes);
                    s.trace.push(Trace::TxDma { bytes });
                    s.tx.flags.insert(DmaFlags::COMPLETE);
                }
            }
            if s.rx.enabled && !s.rx.ran {
                s.rx.ran = true;
                if std::mem::take(&mut s.rx.fail_next) {
                    s.rx.flags.insert(DmaFlags::ERROR);
                    return;
                }
                let (memory, len) = (s.rx.memory as *mut u8, s.rx.len);
                for i in 0..len {
                    let byte = s.next_byte();
                    unsafe { memory.add(i).write(byte) };
                }
                let auto_nack = s.dma_last;
                s.trace.push(Trace::RxDma { len, auto_nack });
                s.rx.flags.insert(DmaFlags::COMPLETE);
            }
        })
    }

    fn pending(&self) -> Option<Irq> {
        self.with(|s| {
            if !s.errors.is_empty() {
                Some(Irq::Error)
            } else if s.start_pending
                || s.addressed
                || (s.byte_irq && s.byte_ready.is_some())
            {
                Some(Irq::Event)
            } else if !s.tx.flags.is_empty() {
                Some(Irq::DmaTx)
            } else if !s.rx.flags.is_empty() {
                Some(Irq::DmaRx)
            } else {
                None
            }
        })
    }
}

pub struct SimPeripheral(Sim);

impl I2cPeripheral for SimPeripheral {
    fn configure(&mut self, config: &Config) {
        self.0.with(|s| s.configured = Some(*config))
    }

    fn is_busy(&self) -> bool {
        self.0.with(|s| s.busy)
    }

    fn events(&self) -> BusEvents {
        self.0.with(|s| {
            let mut events = BusEvents::empty();
            events.set(BusEvents::START, s.start_pending);
            events.set(BusEvents::ADDRESSED, s.addressed);
            events.set(BusEvents::BYTE_RECEIVED, s.byte_ready.is_some());
            events
        })
    }

    fn errors(&self) -> ErrorFlags {
        self.0.with(|s| s.errors)
    }

    fn clear_errors(&mut self, flags: ErrorFlags) {
        self.0.with(|s| s.errors.remove(flags))
    }

    fn generate_start(&mut self) {
        self.0.with(|s| {
            let start = match s.busy {
                true => Trace::RepeatedStart,
                false => Trace::Start,
            };
            s.trace.push(start);
            s.busy = true;
            s.start_pending = true;
        })
    }

    fn generate_stop(&mut self) {
        self.0.with(|s| {
            s.trace.push(Trace::Stop);
            s.busy = false;
        })
    }

    fn send_address(&mut self, address: u8, direction: Direction) {
        self.0.with(|s| {
            let read = direction == Direction::Read;
            s.start_pending = false;
            s.trace.push(Trace::Address { address, read });
            if address == s.peer_address {
                s.addressed = true;
                s.read_mode = read;
            } else {
                s.errors.insert(ErrorFlags::ACK_FAILURE);
            }
        })
    }

    fn clear_address_flag(&mut self) {
        self.0.with(|s| {
            s.addressed = false;
            if s.read_mode && !s.ack {
                s.single_read_pending = true;
            }
        })
    }

    fn set_ack(&mut self, enabled: bool) {
        self.0.with(|s| s.ack = enabled)
    }

    fn set_dma_requests(&mut self, enabled: bool) {
        self.0.with(|s| s.dma_requests = enabled)
    }

    fn set_dma_last_transfer(&mut self, enabled: bool) {
        self.0.with(|s| s.dma_last = enabled)
    }

    fn set_byte_interrupt(&mut self, enabled: bool) {
        self.0.with(|s| s.byte_irq = enabled)
    }

    fn read_byte(&mut self) -> u8 {
        self.0.with(|s| {
            s.trace.push(Trace::ByteRead);
            s.byte_ready.take().unwrap_or(0)
        })
    }
}

pub struct SimDma {
    sim: Sim,
    which: Which,
}

impl DmaChannel for SimDma {
    fn id(&self) -> ChannelId {
        match self.which {
            Which::Tx => TX_CHANNEL,
            Which::Rx => RX_CHANNEL,
        }
    }

    fn configure(&mut self, request: DmaRequest) {
        let which = self.which;
        self.sim.with(|s| {
            let channel = s.channel(which);
            channel.memory = request.memory as usize;
            channel.len = request.len;
            channel.direction = Some(request.direction);
            channel.priority = Some(request.priority);
            channel.ran = false;
        })
    }

    fn enable(&mut self) {
        let which = self.which;
        self.sim.with(|s| s.channel(which).enabled = true)
    }

    fn disable(&mut self) {
        let which = self.which;
        self.sim.with(|s| s.channel(which).enabled = false)
    }

    fn flags(&self) -> DmaFlags {
        let which = self.which;
        self.sim.with(|s| s.channel(which).flags)
    }

    fn clear_flags(&mut self, flags: DmaFlags) {
        let which = self.which;
        self.sim.with(|s| s.channel(which).flags.remove(flags))
    }
}

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ArbiterState {
    held: u32,
    locks: Vec<ChannelId>,
    unlocks: Vec<ChannelId>,
    spurious_unlocks: usize,
}

/// Records every lock and unlock so tests can check channel hygiene.
#[derive(Default)]
pub struct SimArbiter {
    state: Mutex<ArbiterState>,
}

impl SimArbiter {
    /// Mark `channel` as owned by some other driver.
    pub fn hold_for_other(&self, channel: ChannelId) {
        self.state.lock().unwrap().held |= 1 << channel.0;
    }

    pub fn release_for_other(&self, channel: ChannelId) {
        self.state.lock().unwrap().held &= !(1 << channel.0);
    }

    pub fn is_held(&self, channel: ChannelId) -> bool {
        self.state.lock().unwrap().held & (1 << channel.0) != 0
    }

    pub fn locks(&self) -> Vec<ChannelId> {
        self.state.lock().unwrap().locks.clone()
    }

    pub fn unlocks(&self) -> Vec<ChannelId> {
        self.state.lock().unwrap().unlocks.clone()
    }

    pub fn spurious_unlocks(&self) -> usize {
        self.state.lock().unwrap().spurious_unlocks
    }
}

impl DmaArbiter for SimArbiter {
    fn try_lock(&self, channel: ChannelId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.held & (1 << channel.0) != 0 {
            return false;
        }
        state.held |= 1 << channel.0;
        state.locks.push(channel);
        true
    }

    fn unlock(&self, channel: ChannelId) {
        let mut state = self.state.lock().unwrap();
        if state.held & (1 << channel.0) == 0 {
            state.spurious_unlocks += 1;
        }
        state.held &= !(1 << channel.0);
        state.unlocks.push(channel);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn setup<M: RawMutex>(
    peer_address: u8,
    response: &[u8],
) -> (Sim, &'static SimArbiter, Controller<M>) {
    let sim = Sim::new(peer_address, response);
    let arbiter: &'static SimArbiter =
        Box::leak(Box::new(SimArbiter::default()));
    let controller = BusController::new(
        sim.peripheral(),
        sim.dma(Which::Tx),
        sim.dma(Which::Rx),
        arbiter,
    );
    (sim, arbiter, controller)
}

/// Deliver pending interrupts until the hardware goes quiet.
pub fn pump<M: RawMutex>(sim: &Sim, controller: &Controller<M>) {
    for _ in 0..64 {
        critical_section::with(|_| sim.step());
        match sim.pending() {
            Some(Irq::Error) => controller.on_bus_error(),
            Some(Irq::Event) => controller.on_bus_event(),
            Some(Irq::DmaTx) => controller.on_dma_tx(),
            Some(Irq::DmaRx) => controller.on_dma_rx(),
            None => return,
        };
    }
    panic!("interrupt storm, trace so far: {:?}", sim.trace());
}

/// Background thread standing in for the interrupt controller.
pub struct InterruptThread {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InterruptThread {
    pub fn spawn<M>(sim: &Sim, controller: &'static Controller<M>) -> Self
    where
        M: RawMutex + Sync + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let sim = sim.clone();
        let stop = done.clone();
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                pump(&sim, controller);
                std::thread::yield_now();
            }
        });
        Self { done, handle: Some(handle) }
    }
}

impl Drop for InterruptThread {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let result = handle.join();
            if result.is_err() && !std::thread::panicking() {
                panic!("interrupt thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Completion hooks
// ---------------------------------------------------------------------------

/// Hook bookkeeping reached through the descriptor's owner context.
#[derive(Default)]
pub struct HookLog {
    pub descriptor_calls: AtomicUsize,
    pub subscribed_calls: AtomicUsize,
    pub last: Mutex<Option<(Outcome, TransferId)>>,
}

impl HookLog {
    pub fn context(&self) -> *mut () {
        self as *const HookLog as *mut ()
    }

    pub fn calls(&self) -> usize {
        self.descriptor_calls.load(Ordering::SeqCst)
            + self.subscribed_calls.load(Ordering::SeqCst)
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptor_calls.load(Ordering::SeqCst)
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed_calls.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<(Outcome, TransferId)> {
        *self.last.lock().unwrap()
    }
}

fn hook_log(notice: &Notice) -> &HookLog {
    unsafe { &*(notice.context as *const HookLog) }
}

pub fn descriptor_hook(notice: &Notice) {
    let log = hook_log(notice);
    log.descriptor_calls.fetch_add(1, Ordering::SeqCst);
    *log.last.lock().unwrap() = Some((notice.outcome, notice.transfer_id));
}

pub fn subscribed_hook(notice: &Notice) {
    let log = hook_log(notice);
    log.subscribed_calls.fetch_add(1, Ordering::SeqCst);
    *log.last.lock().unwrap() = Some((notice.outcome, notice.transfer_id));
}

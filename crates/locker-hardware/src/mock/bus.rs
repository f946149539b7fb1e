//! Simulated relay cards on an in-memory bus.
//!
//! The mock answers like a chain of 16-channel relay cards: it echoes
//! writes, reports coil states, stores its slave address in register
//! `0x4000` and ignores addresses that have no card. Tests drive it through
//! a [`MockRelayBusHandle`] to inject faults per function code and to
//! inspect every frame that reached the wire, timestamped with the tokio
//! clock so paused-time tests see exact spacing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use locker_core::HardwareAddress;
use locker_core::constants::{
    BROADCAST_ADDRESS, COILS_PER_CARD, DEFAULT_RESPONSE_TIMEOUT_MS, MAX_SLAVE_ADDRESS,
    MIN_SLAVE_ADDRESS, SLAVE_ADDRESS_REGISTER,
};
use locker_protocol::crc::append_crc;
use locker_protocol::{ExceptionCode, FunctionCode, Request};
use tokio::time::Instant;

use crate::error::{BusFault, FaultKind};
use crate::traits::RelayBus;
use crate::types::BusInfo;

/// A frame the mock received.
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub at: Instant,
    pub request: Request,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
struct ScriptedFault {
    function: Option<FunctionCode>,
    slave: Option<u8>,
    /// Only coil writes of this value.
    value: Option<bool>,
    kind: FaultKind,
    remaining: u32,
}

impl ScriptedFault {
    fn matches(&self, request: &Request) -> bool {
        self.remaining > 0
            && self.function.is_none_or(|f| f == request.function())
            && self.slave.is_none_or(|s| s == request.slave())
            && self.value.is_none_or(|v| coil_value(request) == Some(v))
    }
}

fn coil_value(request: &Request) -> Option<bool> {
    match *request {
        Request::WriteSingleCoil { on, .. } | Request::WriteMultipleCoils { on, .. } => Some(on),
        _ => None,
    }
}

#[derive(Debug, Default, Clone)]
struct Card {
    coils: [bool; COILS_PER_CARD as usize],
}

#[derive(Debug)]
struct MockBusState {
    name: String,
    open: bool,
    reopen_fails: bool,
    cards: BTreeMap<u8, Card>,
    faults: Vec<ScriptedFault>,
    frames: Vec<RecordedFrame>,
    latency: Duration,
}

impl MockBusState {
    fn exchange(&mut self, request: &Request) -> Result<Option<BytesMut>, BusFault> {
        if !self.open {
            return Err(BusFault::unavailable(format!("{} is disconnected", self.name)));
        }
        self.frames.push(RecordedFrame {
            at: Instant::now(),
            request: *request,
            bytes: request.encode(),
        });

        if let Some(kind) = self.take_fault(request) {
            return match kind {
                FaultKind::Timeout => Err(BusFault::timeout(DEFAULT_RESPONSE_TIMEOUT_MS)),
                FaultKind::Crc => match self.answer(request) {
                    Some(mut frame) => {
                        let last = frame.len() - 1;
                        frame[last] ^= 0xFF;
                        Ok(Some(frame))
                    }
                    None if request.is_broadcast() => Ok(None),
                    None => Err(BusFault::timeout(DEFAULT_RESPONSE_TIMEOUT_MS)),
                },
                FaultKind::Nack => Ok(Some(exception_frame(
                    request,
                    ExceptionCode::SlaveDeviceBusy,
                ))),
                FaultKind::Io => {
                    self.open = false;
                    Err(BusFault::new(FaultKind::Io, "simulated I/O failure"))
                }
                FaultKind::Unavailable => {
                    self.open = false;
                    Err(BusFault::unavailable("simulated disconnect"))
                }
            };
        }

        match self.answer(request) {
            Some(frame) => Ok(Some(frame)),
            None if request.is_broadcast() => Ok(None),
            None => Err(BusFault::timeout(DEFAULT_RESPONSE_TIMEOUT_MS)),
        }
    }

    fn take_fault(&mut self, request: &Request) -> Option<FaultKind> {
        let fault = self.faults.iter_mut().find(|f| f.matches(request))?;
        fault.remaining -= 1;
        let kind = fault.kind;
        self.faults.retain(|f| f.remaining > 0);
        Some(kind)
    }

    /// Apply the request to the cards and build the reply, if any.
    fn answer(&mut self, request: &Request) -> Option<BytesMut> {
        if request.is_broadcast() {
            self.apply_broadcast(request);
            return None;
        }
        let slave = request.slave();
        let card = self.cards.get_mut(&slave)?;

        let mut reply = vec![slave, request.function().as_u8()];
        match *request {
            Request::WriteSingleCoil { coil, on, .. }
            | Request::WriteMultipleCoils { coil, on, .. } => {
                let Some(state) = card.coils.get_mut(coil as usize) else {
                    return Some(exception_frame(request, ExceptionCode::IllegalDataAddress));
                };
                *state = on;
                if matches!(request, Request::WriteSingleCoil { .. }) {
                    return Some(BytesMut::from(&request.encode()[..]));
                }
                reply.extend_from_slice(&coil.to_be_bytes());
                reply.extend_from_slice(&1u16.to_be_bytes());
            }
            Request::ReadCoils { coil, count, .. } => {
                let start = coil as usize;
                let end = start + count as usize;
                if count == 0 || end > card.coils.len() {
                    return Some(exception_frame(request, ExceptionCode::IllegalDataAddress));
                }
                let bytes = card.coils[start..end].chunks(8).map(|chunk| {
                    chunk
                        .iter()
                        .enumerate()
                        .fold(0u8, |acc, (bit, &on)| acc | (u8::from(on) << bit))
                });
                reply.push(count.div_ceil(8) as u8);
                reply.extend(bytes);
            }
            Request::ReadHoldingRegisters {
                register, count, ..
            } => {
                if register != SLAVE_ADDRESS_REGISTER || count != 1 {
                    return Some(exception_frame(request, ExceptionCode::IllegalDataAddress));
                }
                reply.push(2);
                reply.extend_from_slice(&u16::from(slave).to_be_bytes());
            }
            Request::WriteSingleRegister {
                register, value, ..
            } => {
                if register != SLAVE_ADDRESS_REGISTER {
                    return Some(exception_frame(request, ExceptionCode::IllegalDataAddress));
                }
                let Some(new) = valid_slave(value) else {
                    return Some(exception_frame(request, ExceptionCode::IllegalDataValue));
                };
                if let Some(card) = self.cards.remove(&slave) {
                    self.cards.insert(new, card);
                }
                return Some(BytesMut::from(&request.encode()[..]));
            }
        }
        append_crc(&mut reply);
        Some(BytesMut::from(&reply[..]))
    }

    fn apply_broadcast(&mut self, request: &Request) {
        match *request {
            Request::WriteSingleCoil { coil, on, .. }
            | Request::WriteMultipleCoils { coil, on, .. } => {
                for card in self.cards.values_mut() {
                    if let Some(state) = card.coils.get_mut(coil as usize) {
                        *state = on;
                    }
                }
            }
            Request::WriteSingleRegister {
                register, value, ..
            } if register == SLAVE_ADDRESS_REGISTER => {
                if let Some(new) = valid_slave(value) {
                    // Every card on the line takes the new address.
                    let cards = std::mem::take(&mut self.cards);
                    if let Some(card) = cards.into_values().next() {
                        self.cards.insert(new, card);
                    }
                }
            }
            _ => {}
        }
    }
}

fn valid_slave(value: u16) -> Option<u8> {
    u8::try_from(value)
        .ok()
        .filter(|v| (MIN_SLAVE_ADDRESS..=MAX_SLAVE_ADDRESS).contains(v))
}

fn exception_frame(request: &Request, code: ExceptionCode) -> BytesMut {
    let mut frame = vec![
        request.slave(),
        request.function().exception_code(),
        code.as_u8(),
    ];
    append_crc(&mut frame);
    BytesMut::from(&frame[..])
}

fn lock(state: &Mutex<MockBusState>) -> MutexGuard<'_, MockBusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock RS-485 bus with simulated relay cards.
///
/// # Examples
///
/// ```
/// use locker_hardware::mock::MockRelayBus;
/// use locker_hardware::traits::RelayBus;
/// use locker_hardware::FaultKind;
/// use locker_protocol::{FunctionCode, Request};
///
/// #[tokio::main]
/// async fn main() {
///     let (mut bus, handle) = MockRelayBus::with_cards(1..=2);
///     handle.fail_next(FunctionCode::WriteSingleCoil, FaultKind::Timeout, 1);
///
///     let request = Request::write_single_coil(2, 0, true);
///     assert!(bus.transact(&request).await.is_err());
///     assert!(bus.transact(&request).await.is_ok());
///     assert_eq!(handle.frames().len(), 2);
/// }
/// ```
#[derive(Debug)]
pub struct MockRelayBus {
    state: Arc<Mutex<MockBusState>>,
}

impl MockRelayBus {
    /// Create an empty bus with no cards attached.
    pub fn new() -> (Self, MockRelayBusHandle) {
        Self::with_cards(std::iter::empty())
    }

    /// Create a bus with one card per slave address.
    pub fn with_cards(slaves: impl IntoIterator<Item = u8>) -> (Self, MockRelayBusHandle) {
        let state = MockBusState {
            name: "Mock Relay Bus".to_string(),
            open: true,
            reopen_fails: false,
            cards: slaves.into_iter().map(|s| (s, Card::default())).collect(),
            faults: Vec::new(),
            frames: Vec::new(),
            latency: Duration::ZERO,
        };
        let state = Arc::new(Mutex::new(state));
        let handle = MockRelayBusHandle {
            state: Arc::clone(&state),
        };
        (Self { state }, handle)
    }

    /// Create a bus with enough cards for lockers `1..=count`.
    pub fn for_lockers(count: u16) -> (Self, MockRelayBusHandle) {
        let cards = count.div_ceil(COILS_PER_CARD).min(u16::from(MAX_SLAVE_ADDRESS)) as u8;
        Self::with_cards(1..=cards)
    }
}

impl RelayBus for MockRelayBus {
    async fn transact(&mut self, request: &Request) -> Result<Option<BytesMut>, BusFault> {
        let (reply, latency) = {
            let mut state = lock(&self.state);
            (state.exchange(request), state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        reply
    }

    async fn open(&mut self) -> Result<(), BusFault> {
        let mut state = lock(&self.state);
        if state.reopen_fails {
            return Err(BusFault::unavailable(format!("cannot open {}", state.name)));
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn info(&self) -> BusInfo {
        BusInfo::new(lock(&self.state).name.clone(), "mock")
    }
}

/// Test-side control of a [`MockRelayBus`].
#[derive(Debug, Clone)]
pub struct MockRelayBusHandle {
    state: Arc<Mutex<MockBusState>>,
}

impl MockRelayBusHandle {
    /// Fail the next `times` requests with `function`.
    pub fn fail_next(&self, function: FunctionCode, kind: FaultKind, times: u32) {
        self.push_fault(Some(function), None, None, kind, times);
    }

    /// Fail the next `times` requests of any function sent to `slave`.
    pub fn fail_slave(&self, slave: u8, kind: FaultKind, times: u32) {
        self.push_fault(None, Some(slave), None, kind, times);
    }

    /// Fail the next `times` coil writes of `on` (ON or OFF), any function.
    pub fn fail_next_write(&self, on: bool, kind: FaultKind, times: u32) {
        self.push_fault(None, None, Some(on), kind, times);
    }

    /// Fail every request with `function` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, function: FunctionCode, kind: FaultKind) {
        self.push_fault(Some(function), None, None, kind, u32::MAX);
    }

    fn push_fault(
        &self,
        function: Option<FunctionCode>,
        slave: Option<u8>,
        value: Option<bool>,
        kind: FaultKind,
        times: u32,
    ) {
        lock(&self.state).faults.push(ScriptedFault {
            function,
            slave,
            value,
            kind,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults.clear();
    }

    /// Unplug or replug the adapter. While unplugged, reopening fails.
    pub fn set_connected(&self, connected: bool) {
        let mut state = lock(&self.state);
        state.open = connected;
        state.reopen_fails = !connected;
    }

    /// Delay every answer, as a slow line would.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn add_card(&self, slave: u8) {
        lock(&self.state).cards.entry(slave).or_default();
    }

    pub fn remove_card(&self, slave: u8) {
        lock(&self.state).cards.remove(&slave);
    }

    /// Slave addresses of the attached cards, ascending.
    pub fn card_addresses(&self) -> Vec<u8> {
        lock(&self.state).cards.keys().copied().collect()
    }

    /// Current state of a coil; `false` for missing cards.
    pub fn coil(&self, address: HardwareAddress) -> bool {
        lock(&self.state)
            .cards
            .get(&address.slave)
            .and_then(|card| card.coils.get(address.coil as usize).copied())
            .unwrap_or(false)
    }

    /// Every frame received so far, oldest first.
    pub fn frames(&self) -> Vec<RecordedFrame> {
        lock(&self.state).frames.clone()
    }

    pub fn frames_with(&self, function: FunctionCode) -> Vec<RecordedFrame> {
        lock(&self.state)
            .frames
            .iter()
            .filter(|f| f.request.function() == function)
            .cloned()
            .collect()
    }

    pub fn clear_frames(&self) {
        lock(&self.state).frames.clear();
    }

    /// Coil writes (ON or OFF) sent to `address`, oldest first.
    pub fn coil_writes(&self, address: HardwareAddress) -> Vec<(Instant, bool)> {
        lock(&self.state)
            .frames
            .iter()
            .filter_map(|f| match f.request {
                Request::WriteSingleCoil { slave, coil, on }
                | Request::WriteMultipleCoils { slave, coil, on }
                    if slave == address.slave && coil == address.coil =>
                {
                    Some((f.at, on))
                }
                _ => None,
            })
            .collect()
    }
}

impl Default for MockRelayBus {
    fn default() -> Self {
        Self::new().0
    }
}

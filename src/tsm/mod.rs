//! Transaction State Machine
//!
//! Tracks every confirmed request this node has outstanding. An [`Invoker`]
//! is one transaction: it owns an invoke ID on one peer, the handler that
//! learns how the transaction ended, and the timer guarding the reply.
//!
//! # Lifecycle
//!
//! ```text
//! alloc_invoke_id ──> Allocated ──send_apdu──> InFlight ──reply/timeout──> Completed
//!                                                 │                            │
//!                                          free_invoke_id                free_invoke_id
//!                                                 v                            v
//!                                             Canceled ──last reply/grace──> released
//! ```
//!
//! Invoke IDs are allocated per peer from a 256-bit map, scanning from a
//! cursor that starts at a random position and moves past every ID handed
//! out. Freeing an invoker whose request may still draw a reply does not
//! release its ID at once: the invoker is canceled and the ID stays reserved
//! until that reply arrives or `no_ack_recycle_timeout` has passed since the
//! last transmission. A late reply can therefore never be matched to a new
//! transaction that reused the ID.
//!
//! Timers live in a deadline queue drained by [`Tsm::process_timers`]; with
//! the `async` feature [`spawn_timer_driver`] does that from a tokio task.
//! Handlers are always called with no lock held.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bacnet_session::buffer::BacnetBuf;
//! use bacnet_session::network::{BacnetAddress, NetworkPriority};
//! use bacnet_session::service::ConfirmedServiceChoice;
//! use bacnet_session::tsm::{ApduTransmit, Invoker, InvokerEvent, Tsm, TsmConfig};
//! use bacnet_session::util::ManualClock;
//! use bacnet_session::ApduError;
//!
//! struct Loopback;
//! impl ApduTransmit for Loopback {
//!     fn transmit(&self, _: &BacnetAddress, _: &mut BacnetBuf, _: NetworkPriority) -> Result<(), ApduError> {
//!         Ok(())
//!     }
//! }
//!
//! let tsm = Tsm::new(TsmConfig::default(), Arc::new(ManualClock::new()), Arc::new(Loopback));
//! let peer = BacnetAddress::local(&[10, 0, 0, 9, 0xBA, 0xC0]).unwrap();
//! let invoker = tsm
//!     .alloc_invoke_id(&peer, ConfirmedServiceChoice::ReadProperty, |_: &Invoker, event: InvokerEvent<'_>| {
//!         println!("finished: {:?}", event);
//!     })
//!     .unwrap();
//! let mut apdu = BacnetBuf::from_slice(&[0x00, 0x05, invoker.invoke_id().0, 0x0C]);
//! tsm.send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None).unwrap();
//! ```

mod bitmap;
#[cfg(feature = "async")]
mod driver;

pub use bitmap::{InvokeId, InvokeIdBitmap};
#[cfg(feature = "async")]
pub use driver::spawn_timer_driver;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use log::{debug, error, trace, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::{ApduError, ApduType};
use crate::buffer::BacnetBuf;
use crate::network::{BacnetAddress, NetworkPriority};
use crate::service::{AbortReason, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason};
use crate::util::{lock, read, write, Clock};

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TsmError>;

#[derive(Debug, Error)]
pub enum TsmError {
    #[error("confirmed requests need a unicast destination, not {0}")]
    BroadcastAddress(BacnetAddress),
    #[error("peer table full ({0} peers)")]
    PeerLimit(usize),
    #[error("invoker table full ({0} invokers)")]
    InvokerLimit(usize),
    #[error("no free invoke ID for {0}")]
    NoFreeInvokeId(BacnetAddress),
    #[error("invoker {invoke_id} for {address} is not allocated")]
    NotFound { address: BacnetAddress, invoke_id: InvokeId },
    #[error("invoker {0} already has a request outstanding")]
    Busy(InvokeId),
    #[error("nothing to send for invoker {0}")]
    EmptyApdu(InvokeId),
    #[error("transmission failed: {0}")]
    Send(Box<ApduError>),
}

impl From<ApduError> for TsmError {
    fn from(err: ApduError) -> Self {
        TsmError::Send(Box::new(err))
    }
}

/// Transaction limits and timers
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TsmConfig {
    /// Peers with at least one live invoker
    #[cfg_attr(feature = "serde", serde(rename = "Max_Peer"))]
    pub max_peer: usize,
    /// Live invokers across all peers
    #[cfg_attr(feature = "serde", serde(rename = "Max_Invoker"))]
    pub max_invoker: usize,
    /// Grace period in milliseconds before a canceled invoker's ID is reused
    #[cfg_attr(feature = "serde", serde(rename = "No_Ack_Recycle_Timeout"))]
    pub no_ack_recycle_timeout: u32,
    /// Reply timeout in milliseconds
    #[cfg_attr(feature = "serde", serde(rename = "APDU_Timeout"))]
    pub apdu_timeout: u32,
    #[cfg_attr(feature = "serde", serde(rename = "APDU_Retries"))]
    pub apdu_retries: u8,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            max_peer: 1024,
            max_invoker: 2048,
            no_ack_recycle_timeout: 60_000,
            apdu_timeout: 10_000,
            apdu_retries: 3,
        }
    }
}

impl TsmConfig {
    pub const MIN_PEER: usize = 100;
    pub const MIN_INVOKER: usize = 100;
    pub const MIN_RECYCLE_TIMEOUT: u32 = 5_000;
    pub const MIN_APDU_TIMEOUT: u32 = 5_000;
    pub const MAX_APDU_RETRIES: u8 = 5;

    /// Pulls every value into its permitted range.
    pub fn sanitized(mut self) -> Self {
        if self.max_peer < Self::MIN_PEER {
            warn!("Max_Peer {} too small, using {}", self.max_peer, Self::MIN_PEER);
            self.max_peer = Self::MIN_PEER;
        }
        if self.max_invoker < Self::MIN_INVOKER {
            warn!("Max_Invoker {} too small, using {}", self.max_invoker, Self::MIN_INVOKER);
            self.max_invoker = Self::MIN_INVOKER;
        }
        if self.no_ack_recycle_timeout < Self::MIN_RECYCLE_TIMEOUT {
            warn!(
                "No_Ack_Recycle_Timeout {} too small, using {}",
                self.no_ack_recycle_timeout,
                Self::MIN_RECYCLE_TIMEOUT
            );
            self.no_ack_recycle_timeout = Self::MIN_RECYCLE_TIMEOUT;
        }
        self.apdu_timeout = self.clamp_apdu_timeout(self.apdu_timeout);
        if self.apdu_retries > Self::MAX_APDU_RETRIES {
            warn!("APDU_Retries {} too large, using {}", self.apdu_retries, Self::MAX_APDU_RETRIES);
            self.apdu_retries = Self::MAX_APDU_RETRIES;
        }
        self
    }

    fn clamp_apdu_timeout(&self, timeout: u32) -> u32 {
        let clamped = timeout.clamp(Self::MIN_APDU_TIMEOUT, self.no_ack_recycle_timeout.max(Self::MIN_APDU_TIMEOUT));
        if clamped != timeout {
            warn!("APDU_Timeout {} out of range, using {}", timeout, clamped);
        }
        clamped
    }

    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(self.apdu_timeout as u64)
    }

    pub fn recycle_timeout(&self) -> Duration {
        Duration::from_millis(self.no_ack_recycle_timeout as u64)
    }
}

/// How a transaction ended, as reported to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerEvent<'a> {
    SimpleAck,
    /// Service data following the service choice
    ComplexAck { service_data: &'a [u8] },
    /// Class and code are `None` when the peer's Error PDU did not carry them
    Error {
        class: Option<ErrorClass>,
        code: Option<ErrorCode>,
    },
    Reject { reason: RejectReason },
    Abort { reason: AbortReason, server: bool },
    /// No reply arrived in time. The invoker stays allocated.
    Timeout,
}

impl InvokerEvent<'_> {
    /// PDU type that produced this event; `None` for a timeout.
    pub fn apdu_type(&self) -> Option<ApduType> {
        match self {
            InvokerEvent::SimpleAck => Some(ApduType::SimpleAck),
            InvokerEvent::ComplexAck { .. } => Some(ApduType::ComplexAck),
            InvokerEvent::Error { .. } => Some(ApduType::Error),
            InvokerEvent::Reject { .. } => Some(ApduType::Reject),
            InvokerEvent::Abort { .. } => Some(ApduType::Abort),
            InvokerEvent::Timeout => None,
        }
    }
}

/// Completion callback of one transaction.
///
/// Called at most once per transmission, from whichever thread delivered the
/// reply or drained the timers, and never with a TSM lock held.
pub trait InvokerHandler: Send + Sync {
    fn on_event(&self, invoker: &Invoker, event: InvokerEvent<'_>);
}

impl<F> InvokerHandler for F
where
    F: Fn(&Invoker, InvokerEvent<'_>) + Send + Sync,
{
    fn on_event(&self, invoker: &Invoker, event: InvokerEvent<'_>) {
        self(invoker, event)
    }
}

/// Handle to one outstanding confirmed transaction.
///
/// Handles are cheap to clone. Once the transaction is released, operations
/// through a stale handle fail with [`TsmError::NotFound`] even if the invoke
/// ID has since been reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoker {
    address: BacnetAddress,
    invoke_id: InvokeId,
    service: ConfirmedServiceChoice,
    serial: u64,
}

impl Invoker {
    pub fn address(&self) -> &BacnetAddress {
        &self.address
    }

    pub fn invoke_id(&self) -> InvokeId {
        self.invoke_id
    }

    pub fn service(&self) -> ConfirmedServiceChoice {
        self.service
    }

    fn key(&self) -> Key {
        (self.address, self.invoke_id)
    }
}

/// Where an invoker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerStatus {
    /// ID reserved, nothing sent yet
    Allocated,
    /// Sent and waiting for the reply
    InFlight,
    /// The handler has been told how the last transmission ended
    Completed,
    /// Freed by its owner while a reply may still arrive
    Canceled,
}

/// Sends the confirmed requests the TSM is asked to transmit.
///
/// Implementations should enqueue rather than block. No TSM lock is held
/// during `transmit`.
pub trait ApduTransmit: Send + Sync {
    fn transmit(
        &self,
        dst: &BacnetAddress,
        apdu: &mut BacnetBuf,
        priority: NetworkPriority,
    ) -> std::result::Result<(), ApduError>;
}

type Key = (BacnetAddress, InvokeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Waiting for the reply to the last transmission
    Reply,
    /// Grace period of a canceled invoker
    Recycle,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Duration,
    seq: u64,
    kind: TimerKind,
}

#[derive(Debug)]
struct Peer {
    ids: InvokeIdBitmap,
    cursor: InvokeId,
}

struct InvokerState {
    invoker: Invoker,
    handler: Arc<dyn InvokerHandler>,
    /// Transmissions still waiting for a reply
    not_acked: u32,
    sent: u32,
    canceled: bool,
    last_tx: Option<Duration>,
    timer: Option<Timer>,
}

impl InvokerState {
    fn status(&self) -> InvokerStatus {
        if self.canceled {
            InvokerStatus::Canceled
        } else if matches!(self.timer, Some(Timer { kind: TimerKind::Reply, .. })) {
            InvokerStatus::InFlight
        } else if self.sent == 0 {
            InvokerStatus::Allocated
        } else {
            InvokerStatus::Completed
        }
    }
}

#[derive(Default)]
struct Table {
    peers: HashMap<BacnetAddress, Peer>,
    invokers: HashMap<Key, InvokerState>,
    timers: BTreeMap<(Duration, u64), Key>,
    timer_seq: u64,
    next_serial: u64,
}

impl Table {
    fn get_mut(&mut self, invoker: &Invoker) -> Result<&mut InvokerState> {
        self.invokers
            .get_mut(&invoker.key())
            .filter(|state| state.invoker.serial == invoker.serial)
            .ok_or(TsmError::NotFound {
                address: invoker.address,
                invoke_id: invoker.invoke_id,
            })
    }

    fn arm(&mut self, key: Key, deadline: Duration, kind: TimerKind) {
        self.disarm(key);
        let seq = self.timer_seq;
        self.timer_seq += 1;
        if let Some(state) = self.invokers.get_mut(&key) {
            state.timer = Some(Timer { deadline, seq, kind });
            self.timers.insert((deadline, seq), key);
        }
    }

    fn disarm(&mut self, key: Key) {
        if let Some(timer) = self.invokers.get_mut(&key).and_then(|state| state.timer.take()) {
            self.timers.remove(&(timer.deadline, timer.seq));
        }
    }

    /// Drops the invoker and gives its ID back to the peer.
    fn release(&mut self, key: Key) {
        self.disarm(key);
        if self.invokers.remove(&key).is_none() {
            return;
        }
        let (address, invoke_id) = key;
        if let Some(peer) = self.peers.get_mut(&address) {
            peer.ids.remove(invoke_id);
            if peer.ids.is_empty() {
                self.peers.remove(&address);
                trace!("Peer {} released", address);
            }
        }
        debug!("Invoke ID {} for {} released", invoke_id, address);
    }
}

/// Invoke ID allocator and transaction tracker.
pub struct Tsm {
    config: Mutex<TsmConfig>,
    clock: Arc<dyn Clock>,
    network: Arc<dyn ApduTransmit>,
    table: RwLock<Table>,
}

impl Tsm {
    pub fn new(config: TsmConfig, clock: Arc<dyn Clock>, network: Arc<dyn ApduTransmit>) -> Self {
        Self {
            config: Mutex::new(config.sanitized()),
            clock,
            network,
            table: RwLock::new(Table::default()),
        }
    }

    pub fn config(&self) -> TsmConfig {
        lock(&self.config).clone()
    }

    /// Reserves an invoke ID on `address` for a `service` request.
    pub fn alloc_invoke_id<H>(
        &self,
        address: &BacnetAddress,
        service: ConfirmedServiceChoice,
        handler: H,
    ) -> Result<Invoker>
    where
        H: InvokerHandler + 'static,
    {
        if address.is_broadcast() {
            return Err(TsmError::BroadcastAddress(*address));
        }
        let (max_peer, max_invoker) = {
            let config = lock(&self.config);
            (config.max_peer, config.max_invoker)
        };

        let mut table = write(&self.table);
        if table.invokers.len() >= max_invoker {
            error!("Cannot allocate invoke ID for {}: {} invokers live", address, max_invoker);
            return Err(TsmError::InvokerLimit(max_invoker));
        }
        if !table.peers.contains_key(address) && table.peers.len() >= max_peer {
            error!("Cannot allocate invoke ID for {}: {} peers live", address, max_peer);
            return Err(TsmError::PeerLimit(max_peer));
        }

        let peer = table.peers.entry(*address).or_insert_with(|| Peer {
            ids: InvokeIdBitmap::new(),
            cursor: InvokeId(rand::random::<u8>()),
        });
        let Some(invoke_id) = peer.ids.next_free(peer.cursor) else {
            warn!("All invoke IDs for {} are in use", address);
            return Err(TsmError::NoFreeInvokeId(*address));
        };
        peer.ids.insert(invoke_id);
        peer.cursor = InvokeId(invoke_id.0.wrapping_add(1));

        let serial = table.next_serial;
        table.next_serial += 1;
        let invoker = Invoker {
            address: *address,
            invoke_id,
            service,
            serial,
        };
        table.invokers.insert(
            invoker.key(),
            InvokerState {
                invoker: invoker.clone(),
                handler: Arc::new(handler),
                not_acked: 0,
                sent: 0,
                canceled: false,
                last_tx: None,
                timer: None,
            },
        );
        debug!("Allocated invoke ID {} for {} ({:?})", invoke_id, address, service);
        Ok(invoker)
    }

    /// Transmits `apdu` for `invoker` and arms its reply timer.
    ///
    /// `timeout` of `None` or zero uses the configured APDU timeout. Fails
    /// with [`TsmError::Busy`] while a previous transmission is unanswered.
    pub fn send_apdu(
        &self,
        invoker: &Invoker,
        apdu: &mut BacnetBuf,
        priority: NetworkPriority,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if apdu.is_empty() {
            return Err(TsmError::EmptyApdu(invoker.invoke_id));
        }
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| lock(&self.config).apdu_timeout());

        let now = self.clock.now();
        let (previous_tx, seq) = {
            let mut table = write(&self.table);
            let state = table.get_mut(invoker)?;
            if state.timer.is_some() {
                return Err(TsmError::Busy(invoker.invoke_id));
            }
            let previous_tx = state.last_tx.replace(now);
            state.not_acked += 1;
            state.sent += 1;
            let seq = table.timer_seq;
            table.arm(invoker.key(), now + timeout, TimerKind::Reply);
            (previous_tx, seq)
        };

        if let Err(e) = self.network.transmit(&invoker.address, apdu, priority) {
            self.undo_send(invoker, previous_tx, seq);
            return Err(e.into());
        }
        trace!("Sent invoke ID {} to {} ({} bytes)", invoker.invoke_id, invoker.address, apdu.len());
        Ok(())
    }

    /// Takes back the bookkeeping of a transmission the network refused.
    fn undo_send(&self, invoker: &Invoker, previous_tx: Option<Duration>, seq: u64) {
        let mut table = write(&self.table);
        let key = invoker.key();
        let Ok(state) = table.get_mut(invoker) else {
            return;
        };
        state.not_acked = state.not_acked.saturating_sub(1);
        state.sent = state.sent.saturating_sub(1);
        state.last_tx = previous_tx;
        let ours = matches!(state.timer, Some(Timer { seq: armed, .. }) if armed == seq);
        if state.canceled && state.not_acked == 0 {
            table.release(key);
        } else if ours {
            table.disarm(key);
        }
    }

    /// Releases `invoker`, or cancels it if a reply may still arrive.
    ///
    /// A canceled invoker keeps its ID until the reply to its last
    /// transmission arrives or `no_ack_recycle_timeout` has passed since that
    /// transmission. Its handler is not called again.
    pub fn free_invoke_id(&self, invoker: &Invoker) -> Result<()> {
        let recycle = lock(&self.config).recycle_timeout();
        let now = self.clock.now();

        let mut table = write(&self.table);
        let state = table.get_mut(invoker)?;
        let grace_end = state.last_tx.map(|at| at + recycle);
        match grace_end {
            Some(end) if state.not_acked > 0 && now < end => {
                state.canceled = true;
                debug!(
                    "Invoke ID {} for {} canceled, held for {:?}",
                    invoker.invoke_id,
                    invoker.address,
                    end - now
                );
                table.arm(invoker.key(), end, TimerKind::Recycle);
            }
            _ => table.release(invoker.key()),
        }
        Ok(())
    }

    /// Correlates a reply from `src` with its invoker and reports it.
    ///
    /// `service_choice` is checked against the request for acks and errors
    /// and is `None` for rejects and aborts. Returns true when a handler was
    /// called. Unmatched, mismatched and duplicate replies are dropped.
    pub fn on_response(
        &self,
        src: &BacnetAddress,
        invoke_id: u8,
        service_choice: Option<u8>,
        event: InvokerEvent<'_>,
    ) -> bool {
        let key = (*src, InvokeId(invoke_id));
        let (handler, invoker) = {
            let mut table = write(&self.table);
            let Some(state) = table.invokers.get_mut(&key) else {
                warn!("Reply from {} for unknown invoke ID {}", src, invoke_id);
                return false;
            };
            if let Some(choice) = service_choice {
                if choice != state.invoker.service as u8 {
                    warn!(
                        "Reply from {} for invoke ID {} carries service {} instead of {:?}",
                        src, invoke_id, choice, state.invoker.service
                    );
                    return false;
                }
            }
            if state.not_acked == 0 {
                warn!("Duplicate reply from {} for invoke ID {}", src, invoke_id);
                return false;
            }
            state.not_acked -= 1;

            if state.canceled {
                debug!("Reply from {} for canceled invoke ID {} dropped", src, invoke_id);
                if state.not_acked == 0 {
                    table.release(key);
                }
                return false;
            }
            if !matches!(state.timer, Some(Timer { kind: TimerKind::Reply, .. })) {
                debug!("Late reply from {} for invoke ID {} ignored", src, invoke_id);
                return false;
            }
            let handler = Arc::clone(&state.handler);
            let invoker = state.invoker.clone();
            table.disarm(key);
            (handler, invoker)
        };

        trace!("Invoke ID {} from {} completed with {:?}", invoke_id, src, event.apdu_type());
        handler.on_event(&invoker, event);
        true
    }

    /// Fires every timer that is due. Returns how many fired.
    ///
    /// A reply timer reports [`InvokerEvent::Timeout`]; a grace timer releases
    /// its canceled invoker.
    pub fn process_timers(&self) -> usize {
        let now = self.clock.now();
        let mut expired = Vec::new();
        let mut fired = 0;
        {
            let mut table = write(&self.table);
            while let Some((&(deadline, seq), &key)) = table.timers.first_key_value() {
                if deadline > now {
                    break;
                }
                table.timers.remove(&(deadline, seq));
                fired += 1;
                let Some(state) = table.invokers.get_mut(&key) else {
                    continue;
                };
                let Some(timer) = state.timer.take() else {
                    continue;
                };
                match timer.kind {
                    TimerKind::Reply => {
                        debug!("Invoke ID {} for {} timed out", key.1, key.0);
                        expired.push((Arc::clone(&state.handler), state.invoker.clone()));
                    }
                    TimerKind::Recycle => {
                        debug!("Grace period of invoke ID {} for {} over", key.1, key.0);
                        table.release(key);
                    }
                }
            }
        }

        for (handler, invoker) in expired {
            handler.on_event(&invoker, InvokerEvent::Timeout);
        }
        fired
    }

    /// Earliest armed timer deadline, on the TSM clock.
    pub fn next_deadline(&self) -> Option<Duration> {
        read(&self.table).timers.keys().next().map(|&(deadline, _)| deadline)
    }

    pub fn invoker_status(&self, invoker: &Invoker) -> Option<InvokerStatus> {
        read(&self.table)
            .invokers
            .get(&invoker.key())
            .filter(|state| state.invoker.serial == invoker.serial)
            .map(InvokerState::status)
    }

    /// True while `invoke_id` is reserved on `address`.
    pub fn is_allocated(&self, address: &BacnetAddress, invoke_id: InvokeId) -> bool {
        read(&self.table)
            .peers
            .get(address)
            .is_some_and(|peer| peer.ids.contains(invoke_id))
    }

    pub fn peer_count(&self) -> usize {
        read(&self.table).peers.len()
    }

    pub fn invoker_count(&self) -> usize {
        read(&self.table).invokers.len()
    }

    pub fn apdu_timeout(&self) -> Duration {
        lock(&self.config).apdu_timeout()
    }

    /// Sets the reply timeout and returns the value actually applied.
    pub fn set_apdu_timeout(&self, timeout: Duration) -> Duration {
        let mut config = lock(&self.config);
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        config.apdu_timeout = config.clamp_apdu_timeout(millis);
        config.apdu_timeout()
    }

    /// Retry count for callers that resend on timeout.
    pub fn apdu_retries(&self) -> u8 {
        lock(&self.config).apdu_retries
    }

    /// Sets the retry count and returns the value actually applied.
    pub fn set_apdu_retries(&self, retries: u8) -> u8 {
        let mut config = lock(&self.config);
        config.apdu_retries = retries.min(TsmConfig::MAX_APDU_RETRIES);
        config.apdu_retries
    }
}

impl fmt::Debug for Tsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = read(&self.table);
        f.debug_struct("Tsm")
            .field("peers", &table.peers.len())
            .field("invokers", &table.invokers.len())
            .field("timers", &table.timers.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::testing::{EventLog, RecordingLink};
    use super::*;
    use crate::util::ManualClock;

    struct Fixture {
        clock: Arc<ManualClock>,
        link: Arc<RecordingLink>,
        tsm: Tsm,
        log: Arc<EventLog>,
    }

    fn fixture_with(config: TsmConfig) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Arc::new(ManualClock::new());
        let link = Arc::new(RecordingLink::default());
        let tsm = Tsm::new(config, clock.clone(), link.clone());
        Fixture {
            clock,
            link,
            tsm,
            log: Arc::new(EventLog::default()),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TsmConfig::default())
    }

    fn peer(last: u8) -> BacnetAddress {
        BacnetAddress::local(&[192, 168, 1, last, 0xBA, 0xC0]).unwrap()
    }

    fn request(invoker: &Invoker) -> BacnetBuf {
        BacnetBuf::from_slice(&[0x00, 0x05, invoker.invoke_id().0, invoker.service() as u8])
    }

    impl Fixture {
        fn alloc(&self, address: &BacnetAddress) -> Invoker {
            self.tsm
                .alloc_invoke_id(address, ConfirmedServiceChoice::ReadProperty, self.log.handler())
                .unwrap()
        }

        fn send(&self, invoker: &Invoker) {
            let mut apdu = request(invoker);
            self.tsm
                .send_apdu(invoker, &mut apdu, NetworkPriority::Normal, None)
                .unwrap();
        }
    }

    #[test]
    fn test_config_sanitized() {
        let config = TsmConfig {
            max_peer: 1,
            max_invoker: 2,
            no_ack_recycle_timeout: 100,
            apdu_timeout: 90_000,
            apdu_retries: 9,
        }
        .sanitized();
        assert_eq!(config.max_peer, TsmConfig::MIN_PEER);
        assert_eq!(config.max_invoker, TsmConfig::MIN_INVOKER);
        assert_eq!(config.no_ack_recycle_timeout, 5_000);
        assert_eq!(config.apdu_timeout, 5_000);
        assert_eq!(config.apdu_retries, 5);
    }

    #[test]
    fn test_timeout_and_retry_setters() {
        let f = fixture();
        assert_eq!(f.tsm.apdu_timeout(), Duration::from_secs(10));
        assert_eq!(f.tsm.set_apdu_timeout(Duration::from_millis(10)), Duration::from_secs(5));
        assert_eq!(f.tsm.set_apdu_timeout(Duration::from_secs(3600)), Duration::from_secs(60));
        assert_eq!(f.tsm.set_apdu_timeout(Duration::from_secs(7)), Duration::from_secs(7));
        assert_eq!(f.tsm.apdu_retries(), 3);
        assert_eq!(f.tsm.set_apdu_retries(8), 5);
        assert_eq!(f.tsm.set_apdu_retries(0), 0);
    }

    #[test]
    fn test_broadcast_rejected() {
        let f = fixture();
        let result = f.tsm.alloc_invoke_id(
            &BacnetAddress::global_broadcast(),
            ConfirmedServiceChoice::ReadProperty,
            f.log.handler(),
        );
        assert!(matches!(result, Err(TsmError::BroadcastAddress(_))));
        let result = f.tsm.alloc_invoke_id(
            &BacnetAddress::remote_broadcast(3),
            ConfirmedServiceChoice::ReadProperty,
            f.log.handler(),
        );
        assert!(matches!(result, Err(TsmError::BroadcastAddress(_))));
        assert_eq!(f.tsm.peer_count(), 0);
    }

    #[test]
    fn test_complex_ack_delivered_once() {
        let f = fixture();
        let a = peer(1);
        let invoker = f.alloc(&a);
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::Allocated));
        f.send(&invoker);
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::InFlight));
        assert_eq!(f.link.count(), 1);

        let id = invoker.invoke_id().0;
        let data = [0x09, 0x55];
        let delivered = f.tsm.on_response(
            &a,
            id,
            Some(ConfirmedServiceChoice::ReadProperty as u8),
            InvokerEvent::ComplexAck { service_data: &data },
        );
        assert!(delivered);
        assert_eq!(f.log.len(), 1);
        assert!(f.log.last().unwrap().starts_with("ComplexAck"));
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::Completed));

        // same reply again
        let again = f.tsm.on_response(
            &a,
            id,
            Some(ConfirmedServiceChoice::ReadProperty as u8),
            InvokerEvent::ComplexAck { service_data: &data },
        );
        assert!(!again);
        assert_eq!(f.log.len(), 1);

        f.tsm.free_invoke_id(&invoker).unwrap();
        assert!(!f.tsm.is_allocated(&a, invoker.invoke_id()));
        assert_eq!(f.tsm.peer_count(), 0);
        assert_eq!(f.tsm.invoker_count(), 0);
        assert_eq!(f.tsm.invoker_status(&invoker), None);
    }

    #[test]
    fn test_service_choice_mismatch_dropped() {
        let f = fixture();
        let a = peer(2);
        let invoker = f.alloc(&a);
        f.send(&invoker);

        let wrong = ConfirmedServiceChoice::WriteProperty as u8;
        assert!(!f
            .tsm
            .on_response(&a, invoker.invoke_id().0, Some(wrong), InvokerEvent::SimpleAck));
        assert_eq!(f.log.len(), 0);
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::InFlight));

        // rejects carry no service choice
        assert!(f.tsm.on_response(
            &a,
            invoker.invoke_id().0,
            None,
            InvokerEvent::Reject {
                reason: RejectReason::UnrecognizedService
            },
        ));
        assert_eq!(f.log.len(), 1);
    }

    #[test]
    fn test_reply_from_other_peer_not_matched() {
        let f = fixture();
        let invoker = f.alloc(&peer(3));
        f.send(&invoker);
        assert!(!f
            .tsm
            .on_response(&peer(4), invoker.invoke_id().0, None, InvokerEvent::SimpleAck));
        assert_eq!(f.log.len(), 0);
    }

    #[test]
    fn test_at_most_one_send() {
        let f = fixture();
        let invoker = f.alloc(&peer(5));
        f.send(&invoker);

        let mut apdu = request(&invoker);
        let result = f
            .tsm
            .send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None);
        assert!(matches!(result, Err(TsmError::Busy(_))));
        assert_eq!(f.link.count(), 1);
    }

    #[test]
    fn test_failed_send_arms_nothing() {
        let f = fixture();
        let invoker = f.alloc(&peer(6));
        f.link.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        let mut apdu = request(&invoker);
        let result = f
            .tsm
            .send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None);
        assert!(matches!(result, Err(TsmError::Send(_))));
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::Allocated));
        assert_eq!(f.tsm.next_deadline(), None);

        // nothing outstanding, so free releases at once
        f.tsm.free_invoke_id(&invoker).unwrap();
        assert_eq!(f.tsm.peer_count(), 0);
    }

    #[test]
    fn test_empty_apdu_refused() {
        let f = fixture();
        let invoker = f.alloc(&peer(6));
        let mut apdu = BacnetBuf::new(16);
        let result = f
            .tsm
            .send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None);
        assert!(matches!(result, Err(TsmError::EmptyApdu(_))));
        assert_eq!(f.link.count(), 0);
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::Allocated));
        assert_eq!(f.tsm.next_deadline(), None);
    }

    /// Transmitter that looks at the TSM it sends for, then optionally fails.
    #[derive(Default)]
    struct InspectingLink {
        tsm: std::sync::OnceLock<std::sync::Weak<Tsm>>,
        seen: Mutex<Vec<(usize, Option<InvokerStatus>)>>,
        invoker: Mutex<Option<Invoker>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ApduTransmit for InspectingLink {
        fn transmit(
            &self,
            _dst: &BacnetAddress,
            _apdu: &mut BacnetBuf,
            _priority: NetworkPriority,
        ) -> std::result::Result<(), ApduError> {
            if let Some(tsm) = self.tsm.get().and_then(|weak| weak.upgrade()) {
                let status = self
                    .invoker
                    .lock()
                    .unwrap()
                    .as_ref()
                    .and_then(|invoker| tsm.invoker_status(invoker));
                self.seen.lock().unwrap().push((tsm.invoker_count(), status));
            }
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ApduError::CommunicationDisabled(
                    crate::app::dcc::CommunicationState::Disable,
                ));
            }
            Ok(())
        }
    }

    #[test]
    fn test_transmit_may_call_into_tsm() {
        let link = Arc::new(InspectingLink::default());
        let tsm = Arc::new(Tsm::new(TsmConfig::default(), Arc::new(ManualClock::new()), link.clone()));
        link.tsm.set(Arc::downgrade(&tsm)).unwrap();
        let log = Arc::new(EventLog::default());

        let invoker = tsm
            .alloc_invoke_id(&peer(13), ConfirmedServiceChoice::ReadProperty, log.handler())
            .unwrap();
        *link.invoker.lock().unwrap() = Some(invoker.clone());
        let mut apdu = request(&invoker);
        tsm.send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None)
            .unwrap();
        assert_eq!(link.seen.lock().unwrap()[0], (1, Some(InvokerStatus::InFlight)));
        assert_eq!(tsm.invoker_status(&invoker), Some(InvokerStatus::InFlight));

        // a refused send is taken back once the network returns
        let second = tsm
            .alloc_invoke_id(&peer(13), ConfirmedServiceChoice::ReadProperty, log.handler())
            .unwrap();
        *link.invoker.lock().unwrap() = Some(second.clone());
        link.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut apdu = request(&second);
        let result = tsm.send_apdu(&second, &mut apdu, NetworkPriority::Normal, None);
        assert!(matches!(result, Err(TsmError::Send(_))));
        assert_eq!(link.seen.lock().unwrap()[1], (2, Some(InvokerStatus::InFlight)));
        assert_eq!(tsm.invoker_status(&second), Some(InvokerStatus::Allocated));

        // only the first invoker's timer is left
        tsm.free_invoke_id(&second).unwrap();
        assert_eq!(tsm.invoker_count(), 1);
        assert_eq!(tsm.next_deadline(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_timeout_reported_and_invoker_kept() {
        let f = fixture();
        let a = peer(7);
        let invoker = f.alloc(&a);
        let mut apdu = request(&invoker);
        f.tsm
            .send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, Some(Duration::from_secs(6)))
            .unwrap();
        assert_eq!(f.tsm.next_deadline(), Some(Duration::from_secs(6)));

        f.clock.advance(Duration::from_millis(5_999));
        assert_eq!(f.tsm.process_timers(), 0);
        f.clock.advance(Duration::from_millis(1));
        assert_eq!(f.tsm.process_timers(), 1);
        assert_eq!(f.log.last().as_deref(), Some("Timeout"));
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::Completed));
        assert!(f.tsm.is_allocated(&a, invoker.invoke_id()));

        // the caller may retry on the same invoker
        f.send(&invoker);
        assert_eq!(f.link.count(), 2);
        assert!(f
            .tsm
            .on_response(&a, invoker.invoke_id().0, Some(12), InvokerEvent::SimpleAck));
        // reply to the first transmission arrives late
        assert!(!f
            .tsm
            .on_response(&a, invoker.invoke_id().0, Some(12), InvokerEvent::SimpleAck));
        assert_eq!(f.log.len(), 2);
    }

    #[test]
    fn test_free_with_outstanding_send_cancels() {
        let f = fixture();
        let a = peer(8);
        let invoker = f.alloc(&a);
        let id = invoker.invoke_id();
        f.send(&invoker);

        f.clock.advance(Duration::from_secs(1));
        f.tsm.free_invoke_id(&invoker).unwrap();
        assert_eq!(f.tsm.invoker_status(&invoker), Some(InvokerStatus::Canceled));
        assert!(f.tsm.is_allocated(&a, id));
        assert_eq!(f.tsm.next_deadline(), Some(Duration::from_secs(60)));

        // reply timer was disarmed: no timeout is reported
        f.clock.advance(Duration::from_secs(20));
        assert_eq!(f.tsm.process_timers(), 0);
        assert_eq!(f.log.len(), 0);

        // a new transaction to the same peer never gets the reserved ID
        let others: Vec<_> = (0..255).map(|_| f.alloc(&a)).collect();
        assert!(others.iter().all(|other| other.invoke_id() != id));
        assert!(matches!(
            f.tsm.alloc_invoke_id(&a, ConfirmedServiceChoice::ReadProperty, f.log.handler()),
            Err(TsmError::NoFreeInvokeId(_))
        ));
        for other in &others {
            f.tsm.free_invoke_id(other).unwrap();
        }

        f.clock.set(Duration::from_secs(60));
        assert_eq!(f.tsm.process_timers(), 1);
        assert_eq!(f.log.len(), 0);
        assert!(!f.tsm.is_allocated(&a, id));
        assert_eq!(f.tsm.peer_count(), 0);
        assert_eq!(f.tsm.invoker_status(&invoker), None);
    }

    #[test]
    fn test_late_reply_for_canceled_invoker_releases_it() {
        let f = fixture();
        let a = peer(9);
        let invoker = f.alloc(&a);
        f.send(&invoker);
        f.tsm.free_invoke_id(&invoker).unwrap();

        let delivered = f.tsm.on_response(
            &a,
            invoker.invoke_id().0,
            Some(ConfirmedServiceChoice::ReadProperty as u8),
            InvokerEvent::ComplexAck { service_data: &[] },
        );
        assert!(!delivered);
        assert_eq!(f.log.len(), 0);
        assert_eq!(f.tsm.invoker_count(), 0);
        assert_eq!(f.tsm.next_deadline(), None);
    }

    #[test]
    fn test_free_after_grace_window_releases_at_once() {
        let f = fixture();
        let a = peer(10);
        let invoker = f.alloc(&a);
        f.send(&invoker);
        f.clock.advance(Duration::from_secs(10));
        f.tsm.process_timers();

        f.clock.advance(Duration::from_secs(50));
        f.tsm.free_invoke_id(&invoker).unwrap();
        assert_eq!(f.tsm.invoker_count(), 0);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let f = fixture();
        let a = peer(11);
        let invoker = f.alloc(&a);
        f.tsm.free_invoke_id(&invoker).unwrap();
        assert!(matches!(
            f.tsm.free_invoke_id(&invoker),
            Err(TsmError::NotFound { .. })
        ));
        let mut apdu = request(&invoker);
        assert!(matches!(
            f.tsm.send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None),
            Err(TsmError::NotFound { .. })
        ));
    }

    #[test]
    fn test_peer_capacity_restored_after_release() {
        let f = fixture_with(TsmConfig {
            max_peer: 100,
            ..TsmConfig::default()
        });
        let invokers: Vec<_> = (0..100u8).map(|i| f.alloc(&peer(i))).collect();
        assert_eq!(f.tsm.peer_count(), 100);

        let result =
            f.tsm
                .alloc_invoke_id(&peer(200), ConfirmedServiceChoice::ReadProperty, f.log.handler());
        assert!(matches!(result, Err(TsmError::PeerLimit(100))));
        // a known peer can still allocate
        let extra = f.alloc(&peer(0));

        f.tsm.free_invoke_id(&invokers[7]).unwrap();
        assert_eq!(f.tsm.peer_count(), 99);
        f.alloc(&peer(200));
        assert_eq!(f.tsm.peer_count(), 100);
        f.tsm.free_invoke_id(&extra).unwrap();
    }

    #[test]
    fn test_invoker_capacity() {
        let f = fixture_with(TsmConfig {
            max_invoker: 100,
            ..TsmConfig::default()
        });
        let a = peer(1);
        let b = peer(2);
        for _ in 0..60 {
            f.alloc(&a);
        }
        for _ in 0..40 {
            f.alloc(&b);
        }
        let result = f
            .tsm
            .alloc_invoke_id(&b, ConfirmedServiceChoice::ReadProperty, f.log.handler());
        assert!(matches!(result, Err(TsmError::InvokerLimit(100))));
    }

    #[test]
    fn test_handler_may_reenter() {
        let f = fixture();
        let a = peer(12);
        let tsm = Arc::new(f.tsm);
        let weak = Arc::downgrade(&tsm);
        let invoker = tsm
            .alloc_invoke_id(&a, ConfirmedServiceChoice::ReadProperty, move |invoker: &Invoker, _: InvokerEvent<'_>| {
                if let Some(tsm) = weak.upgrade() {
                    tsm.free_invoke_id(invoker).unwrap();
                }
            })
            .unwrap();
        let mut apdu = request(&invoker);
        tsm.send_apdu(&invoker, &mut apdu, NetworkPriority::Normal, None)
            .unwrap();
        assert!(tsm.on_response(&a, invoker.invoke_id().0, Some(12), InvokerEvent::SimpleAck));
        assert_eq!(tsm.invoker_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_live_invoke_ids_unique(ops in proptest::collection::vec((0u8..3, any::<bool>()), 1..400)) {
            let f = fixture();
            let mut live: Vec<Invoker> = Vec::new();
            for (peer_index, free) in ops {
                if free && !live.is_empty() {
                    let invoker = live.remove(peer_index as usize % live.len());
                    f.tsm.free_invoke_id(&invoker).unwrap();
                } else if let Ok(invoker) = f.tsm.alloc_invoke_id(
                    &peer(peer_index),
                    ConfirmedServiceChoice::ReadProperty,
                    f.log.handler(),
                ) {
                    live.push(invoker);
                }

                let mut seen = HashSet::new();
                for invoker in &live {
                    prop_assert!(seen.insert((*invoker.address(), invoker.invoke_id())));
                }
                prop_assert_eq!(f.tsm.invoker_count(), live.len());
            }
        }
    }
}

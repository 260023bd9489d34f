use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_intrusive::sync::ManualResetEvent;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cmd::{cmd, Cmd, CommandFlags};
use crate::connection::{self, ConnectionWriter};
use crate::counters::ConnectionCounters;
use crate::endpoint::EndpointState;
use crate::errors::{ConnectionFailureKind, Error, Result, TimeoutPhase};
use crate::events::MultiplexerEvent;
use crate::multiplexer::Shared;
use crate::pubsub::{classify_message, SubscriptionKind};
use crate::types::Reply;

/// Which traffic a bridge carries. RESP2 endpoints need a dedicated
/// subscription bridge because subscriber mode poisons the connection for
/// ordinary commands; under RESP3 one interactive bridge carries both and
/// pub/sub arrives as `Push` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BridgeRole {
    Interactive,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum BridgeState {
    Disconnected = 0,
    Connecting = 1,
    ConnectedEstablishing = 2,
    ConnectedEstablished = 3,
}

impl BridgeState {
    fn from_u8(value: u8) -> BridgeState {
        match value {
            1 => BridgeState::Connecting,
            2 => BridgeState::ConnectedEstablishing,
            3 => BridgeState::ConnectedEstablished,
            _ => BridgeState::Disconnected,
        }
    }
}

/// In-flight timeouts tolerated before the connection is deemed suspect and
/// torn down.
const TIMEOUT_SUSPECT_THRESHOLD: u32 = 8;

/// A command accepted by a bridge but not yet written.
pub(crate) struct PendingCommand {
    cmd: Cmd,
    sink: Option<oneshot::Sender<Result<Reply>>>,
    deadline: Instant,
    integrity: Option<[u8; 8]>,
    internal: bool,
}

impl PendingCommand {
    fn fail(mut self, counters: &ConnectionCounters, error: Error) {
        ConnectionCounters::incr(&counters.failed_async);
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(Err(error));
        }
    }
}

/// A command written to the wire whose reply has not yet arrived. The entry
/// stays queued even after its sink is gone (orphaned future, early
/// timeout); the reply must still be consumed to keep FIFO matching intact.
struct InFlightEntry {
    sink: Option<oneshot::Sender<Result<Reply>>>,
    deadline: Instant,
    integrity: Option<[u8; 8]>,
    buffered: Option<Reply>,
    internal: bool,
    timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    Written,
    Queued,
}

/// What the reply path does with a decoded frame.
enum Inbound {
    /// Out-of-band pub/sub message for the registry.
    Message(crate::pubsub::InboundMessage),
    /// Server-initiated push nobody asked for; dropped.
    Discard,
    /// Matches the head of the in-flight FIFO.
    Reply,
}

/// Per-(endpoint, role) owner of the single-writer mutex, the in-flight
/// FIFO and the backlog.
///
/// Invariants:
/// - writes happen only while a `ConnectionWriter` is installed, and only
///   under the writer mutex;
/// - every written command is appended to the in-flight FIFO before the
///   write is flushed, so the n-th reply of a generation always matches the
///   n-th dispatched command;
/// - the backlog is drained only by the drainer task.
pub(crate) struct Bridge {
    pub(crate) role: BridgeRole,
    pub(crate) endpoint: Arc<EndpointState>,
    pub(crate) shared: Arc<Shared>,
    state: AtomicU8,
    writer: tokio::sync::Mutex<Option<ConnectionWriter>>,
    backlog: Mutex<VecDeque<PendingCommand>>,
    drainer_running: AtomicBool,
    in_flight: Mutex<VecDeque<InFlightEntry>>,
    generation: AtomicU64,
    connected_gate: ManualResetEvent,
    pub(crate) counters: ConnectionCounters,
    retry_count: AtomicU32,
    last_retry_ms: AtomicU64,
    connect_started_ms: AtomicU64,
    disconnected_at_ms: AtomicU64,
    last_io_ms: AtomicU64,
    timeout_strikes: AtomicU32,
    dropped: AtomicBool,
    epoch: Instant,
}

impl Bridge {
    pub(crate) fn new(
        role: BridgeRole,
        endpoint: Arc<EndpointState>,
        shared: Arc<Shared>,
    ) -> Arc<Bridge> {
        let bridge = Arc::new(Bridge {
            role,
            endpoint,
            shared,
            state: AtomicU8::new(BridgeState::Disconnected as u8),
            writer: tokio::sync::Mutex::new(None),
            backlog: Mutex::new(VecDeque::new()),
            drainer_running: AtomicBool::new(false),
            in_flight: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            connected_gate: ManualResetEvent::new(false),
            counters: ConnectionCounters::default(),
            retry_count: AtomicU32::new(0),
            last_retry_ms: AtomicU64::new(0),
            connect_started_ms: AtomicU64::new(0),
            disconnected_at_ms: AtomicU64::new(0),
            last_io_ms: AtomicU64::new(0),
            timeout_strikes: AtomicU32::new(0),
            dropped: AtomicBool::new(false),
            epoch: Instant::now(),
        });
        Bridge::spawn_heartbeat(bridge.clone());
        bridge
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BridgeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state() == BridgeState::ConnectedEstablished
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves once the bridge reaches `ConnectedEstablished`, or fails
    /// after `timeout`.
    pub(crate) async fn wait_established(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.connected_gate.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::timeout(TimeoutPhase::Connect)),
        }
    }

    /// Asks the heartbeat state machine to connect now instead of waiting
    /// for the next tick.
    pub(crate) fn kick_connect(self: &Arc<Self>) {
        if self.state() == BridgeState::Disconnected {
            self.start_reconnect();
        }
    }

    // ---- command entry -------------------------------------------------

    /// Core entry point: dispatch a command and await its reply.
    ///
    /// Fire-and-forget commands resolve with `Null` as soon as the bridge
    /// accepts them. All others are bounded by the configured async timeout
    /// (sync timeout for internal calls); the in-flight slot outlives an
    /// expired wait so FIFO matching survives.
    pub(crate) async fn execute(self: &Arc<Self>, command: Cmd) -> Result<Reply> {
        let flags = command.get_flags();
        let internal = flags.contains(CommandFlags::INTERNAL_CALL);
        let fire_and_forget = flags.contains(CommandFlags::FIRE_AND_FORGET);
        let wait = if internal {
            self.shared.options.sync_timeout
        } else {
            self.shared.options.async_timeout
        };
        let deadline = Instant::now() + wait;

        let (sink, receiver) = if fire_and_forget {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        let pending = PendingCommand {
            integrity: flags
                .contains(CommandFlags::HIGH_INTEGRITY)
                .then(integrity_token),
            cmd: command,
            sink,
            deadline,
            internal,
        };

        let outcome = self.submit(pending).await?;
        let Some(receiver) = receiver else {
            return Ok(Reply::Null);
        };
        match tokio::time::timeout(wait, receiver).await {
            Ok(Ok(result)) => result,
            // The entry (and its sink) was dropped without resolving, which
            // only happens when the bridge is torn down mid-flight.
            Ok(Err(_)) => Err(Error::connection(ConnectionFailureKind::SocketClosed)),
            Err(_) => {
                self.timeout_strikes.fetch_add(1, Ordering::Relaxed);
                let phase = match outcome {
                    SubmitOutcome::Written => TimeoutPhase::InFlight,
                    SubmitOutcome::Queued => TimeoutPhase::Backlog,
                };
                Err(Error::timeout(phase))
            }
        }
    }

    async fn submit(self: &Arc<Self>, pending: PendingCommand) -> Result<SubmitOutcome> {
        if self.is_dropped() {
            return Err(Error::MultiplexerClosed);
        }
        ConnectionCounters::incr(&self.counters.operation_count);

        if pending.internal {
            // Internal calls bypass the backlog entirely: they are the
            // handshake and tracers, valid while the bridge is still
            // establishing, and they wait their turn on the writer mutex.
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(Error::connection(ConnectionFailureKind::SocketClosed));
            };
            let generation = writer.generation;
            let result = self.write_one(writer, pending).await;
            drop(guard);
            if let Err(cause) = result {
                self.connection_lost(generation, cause).await;
            }
            return Ok(SubmitOutcome::Written);
        }

        if self.is_established() && self.backlog.lock().unwrap().is_empty() {
            if let Ok(mut guard) = self.writer.try_lock() {
                if let Some(writer) = guard.as_mut() {
                    let generation = writer.generation;
                    let result = self.write_one(writer, pending).await;
                    drop(guard);
                    if let Err(cause) = result {
                        self.connection_lost(generation, cause).await;
                    }
                    return Ok(SubmitOutcome::Written);
                }
            }
        }

        self.enqueue(pending)?;
        Ok(SubmitOutcome::Queued)
    }

    fn enqueue(self: &Arc<Self>, pending: PendingCommand) -> Result<()> {
        let high_priority = pending.cmd.get_flags().contains(CommandFlags::HIGH_PRIORITY);
        {
            let mut backlog = self.backlog.lock().unwrap();
            if backlog.len() >= self.shared.options.backlog_limit {
                return Err(Error::BacklogOverflow);
            }
            if high_priority {
                backlog.push_front(pending);
            } else {
                backlog.push_back(pending);
            }
            ConnectionCounters::incr(&self.counters.pending_unsent);
        }
        self.ensure_drainer();
        Ok(())
    }

    /// Encodes the command (plus its integrity tracer, when requested),
    /// records the in-flight entry, then flushes. The entry goes in before
    /// the flush so a fast reply can never arrive unmatched.
    async fn write_one(
        &self,
        writer: &mut ConnectionWriter,
        mut pending: PendingCommand,
    ) -> std::result::Result<(), ConnectionFailureKind> {
        let mut buf = Vec::with_capacity(pending.cmd.packed_len() + 40);
        pending.cmd.write_packed(&mut buf);
        if let Some(token) = pending.integrity {
            cmd("ECHO").arg(&token[..]).write_packed(&mut buf);
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.push_back(InFlightEntry {
                sink: pending.sink.take(),
                deadline: pending.deadline,
                integrity: pending.integrity,
                buffered: None,
                internal: pending.internal,
                timed_out: false,
            });
            ConnectionCounters::incr(&self.counters.sent_awaiting_response);
        }
        self.last_io_ms.store(self.now_ms(), Ordering::Relaxed);
        writer
            .write_frames(&buf)
            .await
            .map_err(|err| Error::classify_io(&err))
    }

    // ---- backlog drainer ----------------------------------------------

    fn ensure_drainer(self: &Arc<Self>) {
        if self
            .drainer_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let bridge = self.clone();
            tokio::spawn(async move { bridge.drain_loop().await });
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            if self.is_dropped() {
                self.fail_backlog(Error::MultiplexerClosed);
                self.drainer_running.store(false, Ordering::Release);
                return;
            }

            if !self.is_established() {
                self.connected_gate.wait().await;
                continue;
            }

            {
                let mut guard = self.writer.lock().await;
                loop {
                    let Some(writer) = guard.as_mut() else {
                        break;
                    };
                    let Some(pending) = self.pop_backlog_head() else {
                        break;
                    };
                    let generation = writer.generation;
                    if let Err(cause) = self.write_one(writer, pending).await {
                        drop(guard);
                        self.connection_lost(generation, cause).await;
                        break;
                    }
                }
            }

            // Exit only if the backlog stayed empty across the flag flip;
            // otherwise another submit raced us and we keep draining.
            self.drainer_running.store(false, Ordering::Release);
            let more = !self.backlog.lock().unwrap().is_empty();
            if !more
                || self
                    .drainer_running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }

    /// Next writable backlog entry, failing expired heads along the way.
    fn pop_backlog_head(&self) -> Option<PendingCommand> {
        let now = Instant::now();
        let mut backlog = self.backlog.lock().unwrap();
        loop {
            let pending = backlog.pop_front()?;
            ConnectionCounters::decr(&self.counters.pending_unsent);
            if pending.deadline <= now {
                pending.fail(&self.counters, Error::timeout(TimeoutPhase::Backlog));
                continue;
            }
            return Some(pending);
        }
    }

    fn fail_backlog(&self, error: Error) {
        let drained: Vec<PendingCommand> = {
            let mut backlog = self.backlog.lock().unwrap();
            backlog.drain(..).collect()
        };
        for pending in drained {
            ConnectionCounters::decr(&self.counters.pending_unsent);
            pending.fail(&self.counters, error.clone());
        }
    }

    // ---- reply path ----------------------------------------------------

    /// Delivered by the read loop for every decoded frame, in wire order.
    pub(crate) fn on_reply(self: &Arc<Self>, generation: u64, reply: Reply) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.last_io_ms.store(self.now_ms(), Ordering::Relaxed);

        match self.classify_inbound(&reply) {
            Inbound::Message(message) => {
                self.shared.registry.deliver(message);
                return;
            }
            Inbound::Discard => {
                debug!(endpoint = %self.endpoint.addr, "dropping unconsumed push frame");
                return;
            }
            Inbound::Reply => {}
        }

        let resolved = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let Some(head) = in_flight.front_mut() else {
                warn!(endpoint = %self.endpoint.addr, "reply arrived with an empty in-flight queue");
                return;
            };
            if head.integrity.is_some() && head.buffered.is_none() {
                // First of the pair; hold it until the tracer echo confirms
                // the stream is aligned.
                head.buffered = Some(reply);
                return;
            }
            let mut entry = in_flight.pop_front().expect("head checked above");
            match entry.integrity {
                Some(token) => {
                    let verified = reply.as_bytes() == Some(&token[..]);
                    let buffered = entry.buffered.take();
                    if verified {
                        (entry, buffered.ok_or(Error::Integrity))
                    } else {
                        (entry, Err(Error::Integrity))
                    }
                }
                None => (entry, Ok(reply)),
            }
        };
        let (entry, result) = resolved;
        let integrity_failed = matches!(result, Err(Error::Integrity));
        self.resolve_entry(entry, result);

        if integrity_failed {
            // The stream is misaligned or corrupt; nothing after this point
            // can be trusted.
            let bridge = self.clone();
            tokio::spawn(async move {
                bridge
                    .connection_lost(generation, ConnectionFailureKind::ProtocolFailure)
                    .await;
            });
        }
    }

    /// Pub/sub traffic that must not consume an in-flight slot.
    ///
    /// RESP3 `Push` frames are classified by their kind word: messages go to
    /// the registry, subscribe-style confirmations fall through to in-flight
    /// matching, anything else (server-initiated pushes we never asked for)
    /// is discarded. Under RESP2 the subscription bridge sees messages as
    /// plain arrays; an interactive RESP2 bridge only ever treats `smessage`
    /// arrays as out-of-band, since any other array shape could be a
    /// legitimate reply.
    fn classify_inbound(&self, reply: &Reply) -> Inbound {
        match reply.data() {
            Reply::Push(items) => match classify_message(items) {
                Some(message) => Inbound::Message(message),
                None => {
                    const CONFIRMATIONS: &[&[u8]] = &[
                        b"subscribe",
                        b"unsubscribe",
                        b"psubscribe",
                        b"punsubscribe",
                        b"ssubscribe",
                        b"sunsubscribe",
                        b"pong",
                    ];
                    let confirms_command = items
                        .first()
                        .and_then(Reply::as_bytes)
                        .is_some_and(|word| CONFIRMATIONS.contains(&word));
                    if confirms_command {
                        Inbound::Reply
                    } else {
                        Inbound::Discard
                    }
                }
            },
            Reply::Array(Some(items)) => match classify_message(items) {
                Some(message)
                    if self.role == BridgeRole::Subscription
                        || message.kind == SubscriptionKind::Sharded =>
                {
                    Inbound::Message(message)
                }
                _ => Inbound::Reply,
            },
            _ => Inbound::Reply,
        }
    }

    fn resolve_entry(&self, mut entry: InFlightEntry, result: Result<Reply>) {
        ConnectionCounters::decr(&self.counters.sent_awaiting_response);
        let failed = result.is_err();
        if let Some(sink) = entry.sink.take() {
            // An orphaned receiver just discards the reply.
            let _ = sink.send(result);
        }
        if failed {
            ConnectionCounters::incr(&self.counters.failed_async);
        } else if entry.internal {
            ConnectionCounters::incr(&self.counters.completed_sync);
        } else {
            ConnectionCounters::incr(&self.counters.completed_async);
        }
        if !failed && !entry.timed_out {
            self.timeout_strikes.store(0, Ordering::Relaxed);
        }
    }

    /// Read-loop/writer notification of a dead connection. Ignored when it
    /// refers to a generation that has already been superseded.
    pub(crate) async fn connection_lost(
        self: &Arc<Self>,
        generation: u64,
        cause: ConnectionFailureKind,
    ) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.teardown(cause).await;
    }

    /// Tears down whatever connection state exists: fails the in-flight
    /// FIFO in dispatch order, applies the backlog disconnect policy and
    /// leaves the heartbeat to drive the reconnect.
    async fn teardown(self: &Arc<Self>, cause: ConnectionFailureKind) {
        let previous = BridgeState::from_u8(
            self.state
                .swap(BridgeState::Disconnected as u8, Ordering::AcqRel),
        );
        if previous == BridgeState::Disconnected {
            return;
        }
        self.connected_gate.reset();
        self.disconnected_at_ms.store(self.now_ms(), Ordering::Relaxed);

        {
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.take() {
                debug!(
                    endpoint = %self.endpoint.addr,
                    bytes_out = writer.bytes_out(),
                    "writer closed",
                );
            }
        }

        let entries: Vec<InFlightEntry> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.drain(..).collect()
        };
        let failed = entries.len();
        for entry in entries {
            self.resolve_entry(entry, Err(Error::connection(cause)));
        }

        if self.shared.options.backlog_disconnect_timeout.is_zero() {
            self.fail_backlog(Error::timeout(TimeoutPhase::Backlog));
        }

        warn!(
            endpoint = %self.endpoint.addr,
            role = ?self.role,
            %cause,
            failed_in_flight = failed,
            "connection lost",
        );
        self.shared.events.publish(MultiplexerEvent::ConnectionFailed {
            endpoint: self.endpoint.addr.clone(),
            cause,
        });
    }

    // ---- heartbeat, sweeper, reconnect ---------------------------------

    fn spawn_heartbeat(bridge: Arc<Bridge>) {
        tokio::spawn(async move {
            let tick = bridge.shared.options.heartbeat_interval;
            loop {
                tokio::time::sleep(tick).await;
                if bridge.is_dropped() {
                    return;
                }
                bridge.on_heartbeat().await;
            }
        });
    }

    async fn on_heartbeat(self: &Arc<Self>) {
        self.sweep_backlog();
        match self.state() {
            BridgeState::Disconnected => {
                if self.endpoint.is_auth_suspect() {
                    return;
                }
                let count = self.retry_count.load(Ordering::Relaxed);
                let since = self
                    .now_ms()
                    .saturating_sub(self.last_retry_ms.load(Ordering::Relaxed));
                if self.shared.retry.should_retry(count, since) {
                    self.start_reconnect();
                }
            }
            BridgeState::Connecting | BridgeState::ConnectedEstablishing => {
                let started = self.connect_started_ms.load(Ordering::Relaxed);
                let elapsed = self.now_ms().saturating_sub(started);
                if elapsed > self.shared.options.connect_timeout.as_millis() as u64 {
                    // Invalidate the stalled attempt; a later generation will
                    // refuse to install its stream, and any state the attempt
                    // already built (writer, in-flight handshake) is flushed.
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    debug!(endpoint = %self.endpoint.addr, "connect attempt timed out");
                    self.teardown(ConnectionFailureKind::UnableToConnect).await;
                }
            }
            BridgeState::ConnectedEstablished => {
                self.sweep_in_flight().await;
                let idle = self
                    .now_ms()
                    .saturating_sub(self.last_io_ms.load(Ordering::Relaxed));
                if idle >= self.shared.options.keep_alive.as_millis() as u64 {
                    self.spawn_tracer();
                }
            }
        }
    }

    /// Fails expired backlog entries, and the whole backlog once the
    /// disconnect allowance runs out.
    fn sweep_backlog(&self) {
        let now = Instant::now();
        let expired: Vec<PendingCommand> = {
            let mut backlog = self.backlog.lock().unwrap();
            let mut kept = VecDeque::with_capacity(backlog.len());
            let mut expired = Vec::new();
            for pending in backlog.drain(..) {
                if pending.deadline <= now {
                    expired.push(pending);
                } else {
                    kept.push_back(pending);
                }
            }
            *backlog = kept;
            expired
        };
        for pending in expired {
            ConnectionCounters::decr(&self.counters.pending_unsent);
            pending.fail(&self.counters, Error::timeout(TimeoutPhase::Backlog));
        }

        let allowance = self.shared.options.backlog_disconnect_timeout;
        if self.state() == BridgeState::Disconnected && !allowance.is_zero() {
            let down_for = self
                .now_ms()
                .saturating_sub(self.disconnected_at_ms.load(Ordering::Relaxed));
            if down_for > allowance.as_millis() as u64 {
                self.fail_backlog(Error::timeout(TimeoutPhase::Backlog));
            }
        }
    }

    /// Walks the in-flight FIFO for expired entries. Slots are retained --
    /// the server still owes a reply and FIFO matching depends on it -- but
    /// with `cancel_on_timeout` the sink is failed early, and repeated
    /// expiries mark the connection suspect.
    async fn sweep_in_flight(self: &Arc<Self>) {
        let now = Instant::now();
        let cancel = self.shared.options.cancel_on_timeout;
        let mut newly_expired = 0;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for entry in in_flight.iter_mut() {
                if entry.timed_out || entry.deadline > now {
                    continue;
                }
                entry.timed_out = true;
                newly_expired += 1;
                if cancel {
                    if let Some(sink) = entry.sink.take() {
                        ConnectionCounters::incr(&self.counters.failed_async);
                        let _ = sink.send(Err(Error::timeout(TimeoutPhase::InFlight)));
                    }
                }
            }
        }
        if newly_expired > 0 {
            let strikes = self
                .timeout_strikes
                .fetch_add(newly_expired, Ordering::Relaxed)
                + newly_expired;
            if strikes >= TIMEOUT_SUSPECT_THRESHOLD {
                let generation = self.generation.load(Ordering::Acquire);
                warn!(
                    endpoint = %self.endpoint.addr,
                    strikes,
                    "connection suspect after repeated in-flight timeouts",
                );
                self.connection_lost(generation, ConnectionFailureKind::SocketFailure)
                    .await;
            }
        }
    }

    fn spawn_tracer(self: &Arc<Self>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let generation = bridge.generation.load(Ordering::Acquire);
            let result = match bridge.role {
                BridgeRole::Interactive => {
                    let nonce = integrity_token();
                    let reply = bridge
                        .execute(
                            cmd("ECHO")
                                .arg(&nonce[..])
                                .flags(CommandFlags::INTERNAL_CALL),
                        )
                        .await;
                    reply.map(|r| r.as_bytes() == Some(&nonce[..]))
                }
                BridgeRole::Subscription => bridge
                    .execute(cmd("PING").flags(CommandFlags::INTERNAL_CALL))
                    .await
                    .map(|r| !matches!(r.data(), Reply::Error(_))),
            };
            match result {
                Ok(true) => {}
                Ok(false) => {
                    bridge
                        .connection_lost(generation, ConnectionFailureKind::ProtocolFailure)
                        .await;
                }
                Err(err) => {
                    debug!(endpoint = %bridge.endpoint.addr, error = %err, "tracer failed");
                    bridge.shared.events.publish(MultiplexerEvent::InternalError {
                        detail: format!("keep-alive tracer failed: {err}"),
                    });
                }
            }
        });
    }

    fn start_reconnect(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                BridgeState::Disconnected as u8,
                BridgeState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.retry_count.fetch_add(1, Ordering::Relaxed);
        let now = self.now_ms();
        self.last_retry_ms.store(now, Ordering::Relaxed);
        self.connect_started_ms.store(now, Ordering::Relaxed);
        let bridge = self.clone();
        tokio::spawn(async move { bridge.reconnect_task().await });
    }

    async fn reconnect_task(self: Arc<Self>) {
        let options = &self.shared.options;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stream = match connection::open(&self.endpoint.addr, options.connect_timeout).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(endpoint = %self.endpoint.addr, error = %err, "reconnect attempt failed");
                self.set_state(BridgeState::Disconnected);
                self.shared.events.publish(MultiplexerEvent::ConnectionFailed {
                    endpoint: self.endpoint.addr.clone(),
                    cause: ConnectionFailureKind::UnableToConnect,
                });
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        {
            let mut guard = self.writer.lock().await;
            if self.generation.load(Ordering::Acquire) != generation || self.is_dropped() {
                return;
            }
            *guard = Some(ConnectionWriter::new(write_half, generation));
        }
        ConnectionCounters::incr(&self.counters.socket_count);
        self.set_state(BridgeState::ConnectedEstablishing);
        connection::spawn_read_loop(
            self.clone(),
            read_half,
            generation,
            self.shared.protocol(),
            options.max_frame_len,
        );

        match crate::endpoint::establish(&self).await {
            Ok(()) => {
                if let Err(err) = self.restore_subscriptions().await {
                    warn!(
                        endpoint = %self.endpoint.addr,
                        error = %err,
                        "subscription restoration failed",
                    );
                    self.connection_lost(generation, ConnectionFailureKind::SocketFailure)
                        .await;
                    return;
                }
                self.retry_count.store(0, Ordering::Relaxed);
                self.timeout_strikes.store(0, Ordering::Relaxed);
                self.set_state(BridgeState::ConnectedEstablished);
                self.connected_gate.set();
                self.shared
                    .events
                    .publish(MultiplexerEvent::ConnectionRestored {
                        endpoint: self.endpoint.addr.clone(),
                    });
                self.ensure_drainer();
            }
            Err(err) => {
                let cause = match &err {
                    Error::ConnectionFailed { cause } => *cause,
                    Error::Protocol(_) => ConnectionFailureKind::ProtocolFailure,
                    _ => ConnectionFailureKind::SocketFailure,
                };
                if cause == ConnectionFailureKind::AuthFailure {
                    // Retrying with the same credentials cannot succeed.
                    self.endpoint.mark_auth_suspect();
                }
                warn!(endpoint = %self.endpoint.addr, error = %err, "handshake failed");
                self.connection_lost(generation, cause).await;
            }
        }
    }

    /// Re-issues every subscription bound to this endpoint that this bridge
    /// carries, before user work is admitted.
    async fn restore_subscriptions(self: &Arc<Self>) -> Result<()> {
        let resp3 = self.shared.options.resp3;
        let carries: &[SubscriptionKind] = match (self.role, resp3) {
            (BridgeRole::Subscription, _) => &[SubscriptionKind::Exact, SubscriptionKind::Pattern],
            (BridgeRole::Interactive, true) => &[
                SubscriptionKind::Exact,
                SubscriptionKind::Pattern,
                SubscriptionKind::Sharded,
            ],
            (BridgeRole::Interactive, false) => &[SubscriptionKind::Sharded],
        };
        let entries = self.shared.registry.entries_for_server(self.endpoint.id);
        for (channel, kind) in entries {
            if !carries.contains(&kind) {
                continue;
            }
            let wire = self.shared.registry.wire_channel(&channel);
            let reply = self
                .execute(
                    cmd(kind.subscribe_command())
                        .arg(wire)
                        .flags(CommandFlags::INTERNAL_CALL),
                )
                .await?;
            if let Reply::Error(message) = reply.into_data() {
                return Err(Error::Server(message));
            }
            debug!(
                endpoint = %self.endpoint.addr,
                channel = %String::from_utf8_lossy(&channel),
                "subscription restored",
            );
        }
        Ok(())
    }

    // ---- exclusive sessions --------------------------------------------

    /// Holds the single-writer mutex across several commands so nothing can
    /// interleave between them on the wire (transactions, ASKING pairs).
    pub(crate) async fn exclusive_session(self: &Arc<Self>) -> Result<ExclusiveSession<'_>> {
        if !self.is_established() {
            return Err(Error::NoServerAvailable);
        }
        let guard = self.writer.lock().await;
        if guard.is_none() {
            return Err(Error::connection(ConnectionFailureKind::SocketClosed));
        }
        Ok(ExclusiveSession {
            bridge: self,
            guard,
        })
    }

    // ---- shutdown -------------------------------------------------------

    pub(crate) async fn shutdown(self: &Arc<Self>) {
        self.dropped.store(true, Ordering::Relaxed);
        self.teardown(ConnectionFailureKind::SocketClosed).await;
        self.fail_backlog(Error::MultiplexerClosed);
        // Wake the drainer so it can observe the dropped flag and exit.
        self.connected_gate.set();
    }
}

/// Writer-mutex-holding session. Commands written through it are contiguous
/// on the wire; replies still flow through the normal in-flight FIFO.
pub(crate) struct ExclusiveSession<'a> {
    bridge: &'a Arc<Bridge>,
    guard: tokio::sync::MutexGuard<'a, Option<ConnectionWriter>>,
}

impl ExclusiveSession<'_> {
    /// Writes one command and returns the receiver for its reply.
    pub(crate) async fn send_deferred(
        &mut self,
        command: Cmd,
    ) -> Result<oneshot::Receiver<Result<Reply>>> {
        let mut receivers = self.send_batch(vec![command]).await?;
        Ok(receivers.pop().expect("one receiver per command"))
    }

    /// Writes one command and awaits its reply.
    pub(crate) async fn send(&mut self, command: Cmd) -> Result<Reply> {
        let receiver = self.send_deferred(command).await?;
        self.await_reply(receiver).await
    }

    pub(crate) async fn await_reply(
        &self,
        receiver: oneshot::Receiver<Result<Reply>>,
    ) -> Result<Reply> {
        match tokio::time::timeout(self.bridge.shared.options.sync_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::connection(ConnectionFailureKind::SocketClosed)),
            Err(_) => Err(Error::timeout(TimeoutPhase::InFlight)),
        }
    }

    /// Encodes every command into one buffer and flushes it as a single
    /// write, pushing the in-flight entries in order first.
    pub(crate) async fn send_batch(
        &mut self,
        commands: Vec<Cmd>,
    ) -> Result<Vec<oneshot::Receiver<Result<Reply>>>> {
        let Some(writer) = self.guard.as_mut() else {
            return Err(Error::connection(ConnectionFailureKind::SocketClosed));
        };
        let generation = writer.generation;
        let deadline = Instant::now() + self.bridge.shared.options.sync_timeout;

        let mut buf = Vec::new();
        let mut receivers = Vec::with_capacity(commands.len());
        {
            let mut in_flight = self.bridge.in_flight.lock().unwrap();
            for command in &commands {
                command.write_packed(&mut buf);
                let (tx, rx) = oneshot::channel();
                in_flight.push_back(InFlightEntry {
                    sink: Some(tx),
                    deadline,
                    integrity: None,
                    buffered: None,
                    internal: false,
                    timed_out: false,
                });
                ConnectionCounters::incr(&self.bridge.counters.sent_awaiting_response);
                ConnectionCounters::incr(&self.bridge.counters.operation_count);
                receivers.push(rx);
            }
        }
        if let Err(err) = writer.write_frames(&buf).await {
            let cause = Error::classify_io(&err);
            let bridge = self.bridge.clone();
            // The teardown needs the writer mutex this session still holds;
            // hand it to a task that runs once the session is dropped.
            tokio::spawn(async move {
                bridge.connection_lost(generation, cause).await;
            });
            return Err(Error::connection(cause));
        }
        Ok(receivers)
    }
}

fn integrity_token() -> [u8; 8] {
    let token: u32 = rand::random();
    let mut out = [0u8; 8];
    let hex = b"0123456789abcdef";
    for (i, byte) in token.to_be_bytes().iter().enumerate() {
        out[i * 2] = hex[(byte >> 4) as usize];
        out[i * 2 + 1] = hex[(byte & 0x0f) as usize];
    }
    out
}

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::cmd::{cmd, Cmd, CommandFlags};
use crate::codec::ProtocolVersion;
use crate::config::{apply_providers, EndpointAddr, Options, OptionsProvider, ProxyKind};
use crate::counters::{ConnectionCounters, CounterSnapshot};
use crate::endpoint::{Features, ServerEndpoint, ServerRole, ServerType};
use crate::errors::{ConnectionFailureKind, Error, Result};
use crate::events::{EventBus, MultiplexerEvent};
use crate::pubsub::{
    HandlerToken, MessageHandler, SubscriptionKind, SubscriptionQueue, SubscriptionRegistry,
    WireAction,
};
use crate::retry::{ExponentialBackoffPolicy, ReconnectRetryPolicy};
use crate::routing::{self, Redirect, ServerPreference};
use crate::slotmap::{EndpointId, SlotMap, SlotTable};
use crate::transaction::Transaction;
use crate::types::Reply;

const LIFECYCLE_OPEN: u8 = 0;
const LIFECYCLE_CLOSING: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

const LOADING_RETRY_LIMIT: u8 = 3;
const LOADING_RETRY_DELAY: Duration = Duration::from_millis(250);

/// State shared between the multiplexer facade and every bridge it spawns.
/// Deliberately free of endpoint references so the ownership graph stays a
/// DAG: bridges reach endpoints only through ids handed to them.
pub(crate) struct Shared {
    pub(crate) options: Options,
    pub(crate) events: EventBus,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) retry: Arc<dyn ReconnectRetryPolicy>,
    lifecycle: AtomicU8,
}

impl Shared {
    pub(crate) fn protocol(&self) -> ProtocolVersion {
        if self.options.resp3 {
            ProtocolVersion::Resp3
        } else {
            ProtocolVersion::Resp2
        }
    }

    fn is_open(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == LIFECYCLE_OPEN
    }
}

struct MuxInner {
    shared: Arc<Shared>,
    /// Endpoint arena; `EndpointId` indexes into it and entries are never
    /// removed before shutdown.
    endpoints: RwLock<Vec<Arc<ServerEndpoint>>>,
    addr_index: DashMap<EndpointAddr, EndpointId>,
    slots: SlotMap,
    any_start_offset: AtomicUsize,
    topology_refreshing: AtomicBool,
}

/// The connection multiplexer: a long-lived, thread-safe entry point that
/// admits commands from any task, routes each to the right server, and
/// matches replies to callers through per-endpoint single-writer bridges.
///
/// Cloning is cheap and every clone drives the same connections.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Connects using the connection-string grammar
    /// (`host[:port],...,key=value,...`).
    pub async fn connect(config: &str) -> Result<Multiplexer> {
        let options = Options::parse(config)?;
        Multiplexer::connect_with(options, &[]).await
    }

    /// Connects with pre-built options, after running them through the
    /// provider match-list.
    pub async fn connect_with(
        mut options: Options,
        providers: &[Box<dyn OptionsProvider>],
    ) -> Result<Multiplexer> {
        apply_providers(&mut options, providers);
        if options.endpoints.is_empty() {
            return Err(Error::Configuration("no endpoints configured".into()));
        }
        let sentinel_mode = options.service_name.is_some();
        let proxy_mode = options.proxy != ProxyKind::None;
        let registry = SubscriptionRegistry::new(options.channel_prefix.clone());
        let shared = Arc::new(Shared {
            events: EventBus::new(),
            registry,
            retry: Arc::new(ExponentialBackoffPolicy::default()),
            lifecycle: AtomicU8::new(LIFECYCLE_OPEN),
            options,
        });
        let inner = Arc::new(MuxInner {
            shared,
            endpoints: RwLock::new(Vec::new()),
            addr_index: DashMap::new(),
            slots: SlotMap::new(),
            // Seeded randomly so a fleet of clients spreads its round-robin
            // starting points.
            any_start_offset: AtomicUsize::new(rand::random::<u16>() as usize),
            topology_refreshing: AtomicBool::new(false),
        });
        let mux = Multiplexer { inner };

        let configured = mux.inner.shared.options.endpoints.clone();
        for addr in configured {
            let server_type = if sentinel_mode {
                Some(ServerType::Sentinel)
            } else if proxy_mode {
                Some(ServerType::Proxy)
            } else {
                None
            };
            mux.inner.ensure_endpoint_with(&addr, server_type);
        }

        if mux.inner.shared.options.abort_connect {
            mux.finish_initial_setup().await?;
        } else {
            let background = mux.clone();
            tokio::spawn(async move {
                if let Err(err) = background.finish_initial_setup().await {
                    background
                        .inner
                        .shared
                        .events
                        .publish(MultiplexerEvent::InternalError {
                            detail: format!("deferred connect failed: {err}"),
                        });
                }
            });
        }
        Ok(mux)
    }

    async fn finish_initial_setup(&self) -> Result<()> {
        if self.inner.shared.options.service_name.is_some() {
            self.resolve_sentinel().await?;
        }
        self.wait_any_connected().await?;
        if let Some(endpoint) = self.inner.first_connected_cluster() {
            self.refresh_cluster_topology(&endpoint).await?;
        } else {
            self.resolve_tiebreaker().await;
        }
        info!("multiplexer connected");
        Ok(())
    }

    async fn wait_any_connected(&self) -> Result<()> {
        let deadline = Instant::now() + self.inner.shared.options.connect_timeout;
        loop {
            let connected = {
                let endpoints = self.inner.endpoints.read().unwrap();
                endpoints
                    .iter()
                    .any(|e| e.is_connected() && e.state.server_type() != ServerType::Sentinel)
            };
            if connected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::connection(ConnectionFailureKind::UnableToConnect));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Subscribes to lifecycle and topology events.
    pub fn events(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.inner.shared.events.subscribe()
    }

    // ---- command path ---------------------------------------------------

    /// Issues an arbitrary command and awaits its typed reply.
    ///
    /// Selection follows the command's flags and hash slot; MOVED/ASK
    /// redirects, LOADING retries and READONLY demotions are absorbed here,
    /// bounded by the configured redirect limit.
    pub async fn execute(&self, command: Cmd) -> Result<Reply> {
        self.inner.admit(&command)?;
        let flags = command.get_flags();
        let preference = ServerPreference::from_flags(flags);
        let mut redirects: u8 = 0;
        let mut loading_retries: u8 = 0;
        let mut readonly_retried = false;
        let mut next: Option<(Arc<ServerEndpoint>, bool)> = None;

        loop {
            let (endpoint, asking) = match next.take() {
                Some(target) => target,
                None => (self.inner.select(command.hash_slot(), preference)?, false),
            };
            let reply = if asking {
                self.execute_with_asking(&endpoint, &command).await?
            } else {
                endpoint.interactive.execute(command.clone()).await?
            };

            let message = match reply.data() {
                Reply::Error(message) => Some(message.clone()),
                _ => None,
            };
            let Some(message) = message else {
                return Ok(reply);
            };

            if let Some(redirect) = Redirect::parse(&message) {
                if flags.contains(CommandFlags::NO_REDIRECT) {
                    return Err(Error::Server(message));
                }
                redirects += 1;
                if redirects > self.inner.shared.options.redirect_limit {
                    return Err(Error::TooManyRedirects);
                }
                match redirect {
                    Redirect::Moved { slot, addr } => {
                        let from = self.inner.slot_owner_addr(slot);
                        let target = self.inner.ensure_endpoint(&addr);
                        target.state.set_server_type(ServerType::Cluster);
                        self.inner.slots.set_slot_owner(slot, target.id());
                        self.inner
                            .shared
                            .events
                            .publish(MultiplexerEvent::HashSlotMoved {
                                slot,
                                from,
                                to: addr,
                            });
                        self.spawn_topology_refresh();
                        next = Some((target, false));
                    }
                    Redirect::Ask { addr, .. } => {
                        let target = self.inner.ensure_endpoint(&addr);
                        next = Some((target, true));
                    }
                }
                continue;
            }

            if message.starts_with(b"LOADING") {
                loading_retries += 1;
                if loading_retries > LOADING_RETRY_LIMIT {
                    return Err(Error::Server(message));
                }
                tokio::time::sleep(LOADING_RETRY_DELAY).await;
                continue;
            }

            if message.starts_with(b"READONLY") {
                endpoint.state.set_role(ServerRole::Replica);
                self.spawn_topology_refresh();
                if preference != ServerPreference::DemandReplica && !readonly_retried {
                    readonly_retried = true;
                    continue;
                }
                return Err(Error::Server(message));
            }

            if message.starts_with(b"NOAUTH") || message.starts_with(b"WRONGPASS") {
                endpoint.state.mark_auth_suspect();
                return Err(Error::Server(message));
            }

            self.inner
                .shared
                .events
                .publish(MultiplexerEvent::ErrorMessage {
                    endpoint: endpoint.addr().clone(),
                    message: message.clone(),
                });
            return Err(Error::Server(message));
        }
    }

    /// Like [`execute`](Multiplexer::execute), but resolves as soon as the
    /// command is accepted; the reply is matched and discarded.
    pub async fn execute_fire_and_forget(&self, command: Cmd) -> Result<()> {
        let command = command.flags(CommandFlags::FIRE_AND_FORGET);
        self.execute(command).await.map(|_| ())
    }

    /// `ASKING` and the redirected command written back-to-back under one
    /// writer-mutex hold, so no other caller lands between them.
    async fn execute_with_asking(
        &self,
        endpoint: &Arc<ServerEndpoint>,
        command: &Cmd,
    ) -> Result<Reply> {
        let bridge = endpoint.interactive.clone();
        bridge.kick_connect();
        bridge
            .wait_established(self.inner.shared.options.connect_timeout)
            .await?;
        let mut session = bridge.exclusive_session().await?;
        let mut receivers = session
            .send_batch(vec![cmd("ASKING"), command.clone()])
            .await?;
        let reply_rx = receivers.pop().expect("two receivers");
        let asking_rx = receivers.pop().expect("two receivers");
        let asking_reply = session.await_reply(asking_rx).await?;
        if let Reply::Error(message) = asking_reply.into_data() {
            return Err(Error::Server(message));
        }
        session.await_reply(reply_rx).await
    }

    fn spawn_topology_refresh(&self) {
        if self
            .inner
            .topology_refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mux = self.clone();
        tokio::spawn(async move {
            if let Err(err) = mux.reconfigure().await {
                debug!(error = %err, "background topology refresh failed");
                mux.inner
                    .shared
                    .events
                    .publish(MultiplexerEvent::InternalError {
                        detail: format!("topology refresh failed: {err}"),
                    });
            }
            mux.inner.topology_refreshing.store(false, Ordering::Release);
        });
    }

    // ---- pub/sub --------------------------------------------------------

    /// Registers a handler for a channel, issuing the subscribe command on
    /// first registration. Handlers run on the read-loop task and must not
    /// block.
    pub async fn subscribe_with_handler(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        handler: MessageHandler,
    ) -> Result<HandlerToken> {
        self.inner.admit_open()?;
        self.inner.admit_pubsub(kind)?;
        let (token, action) = self
            .inner
            .shared
            .registry
            .add_handler(channel, kind, handler);
        if action == WireAction::Subscribe {
            if let Err(err) = self.issue_subscribe(channel, kind).await {
                self.inner
                    .shared
                    .registry
                    .remove_handler(channel, kind, token);
                self.inner.shared.registry.drop_if_empty(channel, kind);
                return Err(err);
            }
        }
        Ok(token)
    }

    /// Registers a bounded queue for a channel; the caller drains it at its
    /// own pace and overflow drops the oldest message.
    pub async fn subscribe_with_queue(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        queue: &SubscriptionQueue,
    ) -> Result<()> {
        self.inner.admit_open()?;
        self.inner.admit_pubsub(kind)?;
        let action = self.inner.shared.registry.add_queue(channel, kind, queue);
        if action == WireAction::Subscribe {
            if let Err(err) = self.issue_subscribe(channel, kind).await {
                self.inner.shared.registry.remove_queue(channel, kind, queue);
                self.inner.shared.registry.drop_if_empty(channel, kind);
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn unsubscribe_handler(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        token: HandlerToken,
    ) -> Result<()> {
        let action = self
            .inner
            .shared
            .registry
            .remove_handler(channel, kind, token);
        if action == WireAction::Unsubscribe {
            self.issue_unsubscribe(channel, kind).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_queue(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        queue: &SubscriptionQueue,
    ) -> Result<()> {
        let action = self.inner.shared.registry.remove_queue(channel, kind, queue);
        if action == WireAction::Unsubscribe {
            self.issue_unsubscribe(channel, kind).await?;
        }
        Ok(())
    }

    async fn issue_subscribe(&self, channel: &[u8], kind: SubscriptionKind) -> Result<()> {
        let (endpoint, bridge) = self.inner.subscription_target(channel, kind)?;
        if kind == SubscriptionKind::Sharded
            && !endpoint.state.features().supports_sharded_pubsub()
        {
            return Err(Error::CommandNotAvailable("SSUBSCRIBE"));
        }
        bridge.kick_connect();
        let wire = self.inner.shared.registry.wire_channel(channel);
        let reply = bridge.execute(cmd(kind.subscribe_command()).arg(wire)).await?;
        if let Reply::Error(message) = reply.into_data() {
            return Err(Error::Server(message));
        }
        self.inner
            .shared
            .registry
            .attach_server(channel, kind, endpoint.id());
        ConnectionCounters::incr(&bridge.counters.subscriptions);
        Ok(())
    }

    async fn issue_unsubscribe(&self, channel: &[u8], kind: SubscriptionKind) -> Result<()> {
        let registry = &self.inner.shared.registry;
        let Some(id) = registry.server_of(channel, kind) else {
            registry.drop_if_empty(channel, kind);
            return Ok(());
        };
        let Some(endpoint) = self.inner.endpoint_by_id(id) else {
            registry.drop_if_empty(channel, kind);
            return Ok(());
        };
        let bridge = self.inner.bridge_for_kind(&endpoint, kind);
        let wire = registry.wire_channel(channel);
        let reply = bridge
            .execute(cmd(kind.unsubscribe_command()).arg(wire))
            .await?;
        if let Reply::Error(message) = reply.into_data() {
            return Err(Error::Server(message));
        }
        registry.drop_if_empty(channel, kind);
        ConnectionCounters::decr(&bridge.counters.subscriptions);
        Ok(())
    }

    // ---- transactions ---------------------------------------------------

    /// Runs a MULTI/EXEC block, WATCH preconditions first, everything on one
    /// bridge under a single writer-mutex hold. An `Array` EXEC reply fans
    /// out per-command results in dispatch order; a null EXEC reply means a
    /// watched key changed.
    pub async fn run_transaction(&self, transaction: &Transaction) -> Result<Vec<Reply>> {
        self.inner.admit_open()?;
        if self.inner.shared.options.proxy != ProxyKind::None {
            return Err(Error::CommandNotAvailable("MULTI"));
        }
        if transaction.is_empty() {
            return Ok(Vec::new());
        }
        let slot = transaction.combined_slot()?;
        let endpoint = self.inner.select(slot, ServerPreference::DemandPrimary)?;
        let bridge = endpoint.interactive.clone();
        bridge.kick_connect();
        bridge
            .wait_established(self.inner.shared.options.connect_timeout)
            .await?;
        let features = endpoint.state.features();
        let mut session = bridge.exclusive_session().await?;

        for condition in transaction.conditions() {
            let watched = session
                .send(cmd("WATCH").arg_key(condition.key()))
                .await?;
            if let Reply::Error(message) = watched.into_data() {
                return Err(Error::Server(message));
            }
            let checked = session.send(condition.check_command()).await?;
            if let Reply::Error(message) = checked.data() {
                let _ = session.send(cmd("UNWATCH")).await;
                return Err(Error::Server(message.clone()));
            }
            if !condition.is_satisfied(&checked) {
                let _ = session.send(cmd("UNWATCH")).await;
                return Err(Error::TransactionAborted);
            }
        }

        let exec_reply = if features.supports_execabort() {
            // The server aborts EXEC itself on a rejected queue entry, so
            // the whole block can go out as one contiguous write.
            let mut batch = Vec::with_capacity(transaction.len() + 2);
            batch.push(cmd("MULTI"));
            batch.extend(transaction.commands().iter().cloned());
            batch.push(cmd("EXEC"));
            let mut receivers = session.send_batch(batch).await?;
            let exec_rx = receivers.pop().expect("EXEC receiver");
            let mut pending = receivers.into_iter();
            let multi = session
                .await_reply(pending.next().expect("MULTI receiver"))
                .await?;
            if let Reply::Error(message) = multi.into_data() {
                return Err(Error::Server(message));
            }
            for receiver in pending {
                // Rejected commands surface through EXECABORT below.
                let _ = session.await_reply(receiver).await?;
            }
            session.await_reply(exec_rx).await?
        } else {
            let mut batch = Vec::with_capacity(transaction.len() + 1);
            batch.push(cmd("MULTI"));
            batch.extend(transaction.commands().iter().cloned());
            let receivers = session.send_batch(batch).await?;
            let mut pending = receivers.into_iter();
            let multi = session
                .await_reply(pending.next().expect("MULTI receiver"))
                .await?;
            if let Reply::Error(message) = multi.into_data() {
                return Err(Error::Server(message));
            }
            let mut rejected = false;
            for receiver in pending {
                let queued = session.await_reply(receiver).await?;
                if !queued.simple_matches(b"QUEUED") {
                    rejected = true;
                }
            }
            if rejected {
                let _ = session.send(cmd("DISCARD")).await;
                return Err(Error::TransactionRejected);
            }
            session.send(cmd("EXEC")).await?
        };
        drop(session);

        match exec_reply.into_data() {
            Reply::Array(Some(items)) => Ok(items),
            reply if reply.is_null() => Err(Error::TransactionAborted),
            Reply::Error(message) => {
                if message.starts_with(b"EXECABORT") {
                    Err(Error::TransactionRejected)
                } else {
                    Err(Error::Server(message))
                }
            }
            other => Err(Error::Protocol(format!(
                "unexpected EXEC reply: {other:?}"
            ))),
        }
    }

    // ---- topology -------------------------------------------------------

    /// Re-fetches the deployment topology (cluster slots, sentinel master,
    /// or standalone roles) and swaps the routing state atomically.
    pub async fn reconfigure(&self) -> Result<()> {
        self.inner.admit_open()?;
        if let Some(endpoint) = self.inner.first_connected_cluster() {
            return self.refresh_cluster_topology(&endpoint).await;
        }
        if self.inner.shared.options.service_name.is_some() {
            self.resolve_sentinel().await?;
        } else {
            self.refresh_roles().await;
        }
        self.inner
            .shared
            .events
            .publish(MultiplexerEvent::ConfigurationChanged);
        Ok(())
    }

    async fn refresh_cluster_topology(&self, endpoint: &Arc<ServerEndpoint>) -> Result<()> {
        let reply = endpoint
            .interactive
            .execute(
                cmd("CLUSTER")
                    .arg("SLOTS")
                    .flags(CommandFlags::INTERNAL_CALL),
            )
            .await?;
        if let Reply::Error(message) = reply.data() {
            return Err(Error::Server(message.clone()));
        }
        let ranges = self.apply_cluster_slots(reply)?;
        self.inner.slots.replace(SlotTable::from_ranges(&ranges));
        self.inner
            .shared
            .events
            .publish(MultiplexerEvent::ConfigurationChanged);
        debug!(ranges = ranges.len(), "slot map refreshed");
        Ok(())
    }

    /// Parses a CLUSTER SLOTS reply, creating endpoints for newly discovered
    /// nodes and refreshing shard roles and replica lists.
    fn apply_cluster_slots(&self, reply: Reply) -> Result<Vec<(u16, u16, EndpointId)>> {
        let shape = || Error::Protocol("unexpected CLUSTER SLOTS shape".into());
        let node_addr = |node: &Reply| -> Option<EndpointAddr> {
            let fields = node.as_items()?;
            let host = fields.first()?.as_text()?;
            let port = fields.get(1)?.as_int()?;
            (!host.is_empty() && (0..=u16::MAX as i64).contains(&port))
                .then(|| EndpointAddr::new(host, port as u16))
        };

        let items = reply.into_items().ok_or_else(shape)?;
        let mut ranges = Vec::with_capacity(items.len());
        for range in items {
            let fields = range.into_items().ok_or_else(shape)?;
            let start = fields.first().and_then(Reply::as_int).ok_or_else(shape)?;
            let end = fields.get(1).and_then(Reply::as_int).ok_or_else(shape)?;
            if !(0..routing::SLOT_COUNT as i64).contains(&start)
                || !(0..routing::SLOT_COUNT as i64).contains(&end)
            {
                return Err(shape());
            }
            let primary_addr = fields.get(2).and_then(|n| node_addr(n)).ok_or_else(shape)?;
            let primary = self
                .inner
                .ensure_endpoint_with(&primary_addr, Some(ServerType::Cluster));
            primary.state.set_role(ServerRole::Primary);

            let mut replica_ids = Vec::new();
            for node in fields.iter().skip(3) {
                let Some(addr) = node_addr(node) else {
                    continue;
                };
                let replica = self
                    .inner
                    .ensure_endpoint_with(&addr, Some(ServerType::Cluster));
                replica.state.set_role(ServerRole::Replica);
                replica_ids.push(replica.id());
            }
            primary.set_replicas(replica_ids);
            ranges.push((start as u16, end as u16, primary.id()));
        }
        Ok(ranges)
    }

    /// Initial sentinel master lookup: ask each configured sentinel for the
    /// service master, register it, and learn the other sentinels.
    async fn resolve_sentinel(&self) -> Result<()> {
        let service = self
            .inner
            .shared
            .options
            .service_name
            .clone()
            .ok_or_else(|| Error::Configuration("sentinel resolution without serviceName".into()))?;
        let sentinels: Vec<Arc<ServerEndpoint>> = {
            let endpoints = self.inner.endpoints.read().unwrap();
            endpoints
                .iter()
                .filter(|e| e.state.server_type() == ServerType::Sentinel)
                .cloned()
                .collect()
        };
        let connect_timeout = self.inner.shared.options.connect_timeout;
        for sentinel in sentinels {
            sentinel.interactive.kick_connect();
            if sentinel
                .interactive
                .wait_established(connect_timeout)
                .await
                .is_err()
            {
                continue;
            }
            let master = sentinel
                .interactive
                .execute(
                    cmd("SENTINEL")
                        .arg("get-master-addr-by-name")
                        .arg(&service)
                        .flags(CommandFlags::INTERNAL_CALL),
                )
                .await;
            let Ok(reply) = master else {
                continue;
            };
            let Some(items) = reply.into_items() else {
                continue;
            };
            let (Some(host), Some(port)) = (
                items.first().and_then(Reply::as_text),
                items
                    .get(1)
                    .and_then(|p| p.as_int().or_else(|| p.as_text()?.parse().ok())),
            ) else {
                continue;
            };
            if !(0..=u16::MAX as i64).contains(&port) {
                continue;
            }
            let addr = EndpointAddr::new(host, port as u16);
            let primary = self.inner.ensure_endpoint_with(&addr, None);
            primary.state.set_role(ServerRole::Primary);
            info!(master = %addr, service = %service, "sentinel master resolved");

            // Best effort: learn the rest of the sentinel group.
            if let Ok(reply) = sentinel
                .interactive
                .execute(
                    cmd("SENTINEL")
                        .arg("sentinels")
                        .arg(&service)
                        .flags(CommandFlags::INTERNAL_CALL),
                )
                .await
            {
                for peer in reply.into_items().unwrap_or_default() {
                    if let Some(addr) = sentinel_peer_addr(&peer) {
                        self.inner
                            .ensure_endpoint_with(&addr, Some(ServerType::Sentinel));
                    }
                }
            }
            return Ok(());
        }
        Err(Error::NoServerAvailable)
    }

    /// Standalone role re-probe for every connected endpoint.
    async fn refresh_roles(&self) {
        let endpoints: Vec<Arc<ServerEndpoint>> = {
            let guard = self.inner.endpoints.read().unwrap();
            guard
                .iter()
                .filter(|e| e.is_connected() && e.state.server_type() == ServerType::Standalone)
                .cloned()
                .collect()
        };
        for endpoint in endpoints {
            let reply = endpoint
                .interactive
                .execute(
                    cmd("INFO")
                        .arg("REPLICATION")
                        .flags(CommandFlags::INTERNAL_CALL),
                )
                .await;
            if let Ok(reply) = reply {
                if let Some(text) = reply.as_text() {
                    let mut scratch = Features::default();
                    crate::endpoint::apply_info_replication(&endpoint.state, &mut scratch, &text);
                }
            }
        }
        self.resolve_tiebreaker().await;
    }

    /// Split-brain resolution: when two standalone primaries are visible,
    /// read the tie-breaker key from each and keep the one whose stored
    /// value names its own address; everyone else is demoted.
    async fn resolve_tiebreaker(&self) {
        let Some(key) = self.inner.shared.options.tie_breaker.clone() else {
            return;
        };
        let primaries: Vec<Arc<ServerEndpoint>> = {
            let endpoints = self.inner.endpoints.read().unwrap();
            endpoints
                .iter()
                .filter(|e| {
                    e.is_connected()
                        && e.state.role() == ServerRole::Primary
                        && e.state.server_type() == ServerType::Standalone
                })
                .cloned()
                .collect()
        };
        if primaries.len() < 2 {
            return;
        }
        let mut winner = None;
        for endpoint in &primaries {
            let value = endpoint
                .interactive
                .execute(
                    cmd("GET")
                        .arg_key(key.as_bytes())
                        .flags(CommandFlags::INTERNAL_CALL),
                )
                .await
                .ok()
                .and_then(|reply| reply.as_text());
            if value.as_deref() == Some(endpoint.addr().to_string().as_str()) {
                winner = Some(endpoint.id());
                break;
            }
        }
        let winner = winner.unwrap_or_else(|| primaries[0].id());
        for endpoint in &primaries {
            if endpoint.id() != winner {
                warn!(endpoint = %endpoint.addr(), "demoting split-brain primary");
                endpoint.state.set_role(ServerRole::Replica);
            }
        }
    }

    // ---- administration -------------------------------------------------

    /// Administrative access to one endpoint, bypassing selection.
    pub fn get_server(&self, addr: &EndpointAddr) -> Option<ServerHandle> {
        let id = *self.inner.addr_index.get(addr)?;
        let endpoint = self.inner.endpoint_by_id(id)?;
        Some(ServerHandle { endpoint })
    }

    /// Addresses of every endpoint the multiplexer currently knows.
    pub fn known_endpoints(&self) -> Vec<EndpointAddr> {
        let endpoints = self.inner.endpoints.read().unwrap();
        endpoints.iter().map(|e| e.addr().clone()).collect()
    }

    /// Stops admission, optionally drains outstanding work, then closes
    /// every bridge and its heartbeat.
    pub async fn close(&self, graceful: bool) {
        self.inner
            .shared
            .lifecycle
            .store(LIFECYCLE_CLOSING, Ordering::Release);
        if graceful {
            let deadline = Instant::now() + self.inner.shared.options.sync_timeout;
            loop {
                let busy = {
                    let endpoints = self.inner.endpoints.read().unwrap();
                    endpoints.iter().any(|e| {
                        let snapshot = e.interactive.counters.snapshot();
                        snapshot.sent_awaiting_response > 0 || snapshot.pending_unsent > 0
                    })
                };
                if !busy || Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        let endpoints: Vec<Arc<ServerEndpoint>> =
            self.inner.endpoints.read().unwrap().iter().cloned().collect();
        for endpoint in endpoints {
            endpoint.interactive.shutdown().await;
            if let Some(subscription) = &endpoint.subscription {
                subscription.shutdown().await;
            }
        }
        self.inner
            .shared
            .lifecycle
            .store(LIFECYCLE_CLOSED, Ordering::Release);
        info!("multiplexer closed");
    }
}

fn sentinel_peer_addr(peer: &Reply) -> Option<EndpointAddr> {
    // SENTINEL sentinels replies are flat field/value arrays (RESP2) or maps
    // (RESP3); find the ip/port pair either way.
    let mut ip = None;
    let mut port = None;
    let mut visit = |key: &Reply, value: &Reply| {
        if key.as_bytes() == Some(b"ip") {
            ip = value.as_text();
        } else if key.as_bytes() == Some(b"port") {
            port = value
                .as_int()
                .or_else(|| value.as_text().and_then(|t| t.parse().ok()));
        }
    };
    match peer.data() {
        Reply::Map(pairs) => {
            for (key, value) in pairs {
                visit(key, value);
            }
        }
        _ => {
            let items = peer.as_items()?;
            let mut iter = items.iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                visit(key, value);
            }
        }
    }
    let port = port?;
    if !(0..=u16::MAX as i64).contains(&port) {
        return None;
    }
    Some(EndpointAddr::new(ip?, port as u16))
}

impl MuxInner {
    fn admit_open(&self) -> Result<()> {
        if self.shared.is_open() {
            Ok(())
        } else {
            Err(Error::MultiplexerClosed)
        }
    }

    /// Admission gate run before selection: lifecycle, cross-slot, database
    /// pinning, and the admin/proxy command policies.
    fn admit(&self, command: &Cmd) -> Result<()> {
        self.admit_open()?;
        // Everything admitted here goes through dynamic selection, so a
        // multi-slot command can never be routed correctly; it fails before
        // any bridge is touched.
        if command.is_cross_slot() {
            return Err(Error::CrossSlot);
        }
        let db = command.get_db();
        if db >= 0 && db != self.shared.options.default_database {
            return Err(Error::Configuration(format!(
                "command pinned to db {db} but the multiplexer uses db {}",
                self.shared.options.default_database
            )));
        }
        // Subscriber-mode commands would poison the interactive connection;
        // they are only ever issued through the subscription registry.
        if let Some(name) = subscriber_command_name(command.name()) {
            return Err(Error::Configuration(format!(
                "{name} must go through the subscribe/unsubscribe API"
            )));
        }
        if !self.shared.options.allow_admin {
            if let Some(name) = admin_command_name(command.name()) {
                return Err(Error::CommandNotAvailable(name));
            }
        }
        if self.shared.options.proxy != ProxyKind::None {
            if let Some(name) = proxy_restricted_name(command.name()) {
                return Err(Error::CommandNotAvailable(name));
            }
        }
        Ok(())
    }

    fn admit_pubsub(&self, kind: SubscriptionKind) -> Result<()> {
        if self.shared.options.proxy != ProxyKind::None {
            return Err(Error::CommandNotAvailable(kind.subscribe_command()));
        }
        Ok(())
    }

    fn ensure_endpoint(&self, addr: &EndpointAddr) -> Arc<ServerEndpoint> {
        self.ensure_endpoint_with(addr, None)
    }

    fn ensure_endpoint_with(
        &self,
        addr: &EndpointAddr,
        server_type: Option<ServerType>,
    ) -> Arc<ServerEndpoint> {
        if let Some(id) = self.addr_index.get(addr).map(|entry| *entry) {
            if let Some(endpoint) = self.endpoint_by_id(id) {
                return endpoint;
            }
        }
        let endpoint = {
            let mut endpoints = self.endpoints.write().unwrap();
            if let Some(id) = self.addr_index.get(addr).map(|entry| *entry) {
                endpoints[id.index()].clone()
            } else {
                let id = EndpointId(endpoints.len() as u32);
                let endpoint = ServerEndpoint::create(id, addr.clone(), self.shared.clone());
                if let Some(server_type) = server_type {
                    endpoint.state.set_server_type(server_type);
                }
                endpoints.push(endpoint.clone());
                self.addr_index.insert(addr.clone(), id);
                debug!(endpoint = %addr, id = id.index(), "endpoint registered");
                endpoint
            }
        };
        endpoint.interactive.kick_connect();
        endpoint
    }

    fn endpoint_by_id(&self, id: EndpointId) -> Option<Arc<ServerEndpoint>> {
        self.endpoints.read().unwrap().get(id.index()).cloned()
    }

    fn slot_owner_addr(&self, slot: u16) -> Option<EndpointAddr> {
        let id = self.slots.lookup(slot)?;
        Some(self.endpoint_by_id(id)?.addr().clone())
    }

    fn first_connected_cluster(&self) -> Option<Arc<ServerEndpoint>> {
        let endpoints = self.endpoints.read().unwrap();
        endpoints
            .iter()
            .find(|e| {
                e.is_connected()
                    && (e.state.server_type() == ServerType::Cluster
                        || e.state.features().cluster_enabled)
            })
            .cloned()
    }

    /// Endpoint selection per slot and preference. Single-endpoint
    /// deployments short-circuit: the bridge's backlog absorbs outages.
    fn select(
        &self,
        slot: Option<u16>,
        preference: ServerPreference,
    ) -> Result<Arc<ServerEndpoint>> {
        let endpoints = self.endpoints.read().unwrap();
        let candidates: Vec<&Arc<ServerEndpoint>> = endpoints
            .iter()
            .filter(|e| e.state.server_type() != ServerType::Sentinel)
            .collect();
        match candidates.len() {
            0 => Err(Error::NoServerAvailable),
            1 => Ok(candidates[0].clone()),
            _ => {
                if let Some(slot) = slot {
                    if let Some(owner) = self.slots.lookup(slot) {
                        if let Some(primary) = endpoints.get(owner.index()).cloned() {
                            return self.choose_in_shard(&endpoints, primary, preference);
                        }
                    }
                }
                self.round_robin(&candidates, preference)
            }
        }
    }

    fn choose_in_shard(
        &self,
        endpoints: &[Arc<ServerEndpoint>],
        primary: Arc<ServerEndpoint>,
        preference: ServerPreference,
    ) -> Result<Arc<ServerEndpoint>> {
        let start = self.any_start_offset.fetch_add(1, Ordering::Relaxed);
        let replica_pick = {
            let ids = primary.replica_ids();
            let mut found = None;
            for i in 0..ids.len() {
                let id = ids[(start + i) % ids.len()];
                if let Some(endpoint) = endpoints.get(id.index()) {
                    if endpoint.is_connected() {
                        found = Some(endpoint.clone());
                        break;
                    }
                }
            }
            found
        };
        match preference {
            ServerPreference::DemandPrimary => {
                if primary.is_connected() {
                    Ok(primary)
                } else {
                    Err(Error::NoServerAvailable)
                }
            }
            ServerPreference::DemandReplica => replica_pick.ok_or(Error::NoServerAvailable),
            ServerPreference::PreferPrimary => {
                if primary.is_connected() {
                    Ok(primary)
                } else {
                    Ok(replica_pick.unwrap_or(primary))
                }
            }
            ServerPreference::PreferReplica => Ok(replica_pick.unwrap_or(primary)),
        }
    }

    /// Round-robin for non-keyed commands, role-filtered first, then any
    /// connected server, then anything at all (whose backlog will hold the
    /// command through the outage).
    fn round_robin(
        &self,
        candidates: &[&Arc<ServerEndpoint>],
        preference: ServerPreference,
    ) -> Result<Arc<ServerEndpoint>> {
        let wanted = if preference.wants_replica() {
            ServerRole::Replica
        } else {
            ServerRole::Primary
        };
        let start = self.any_start_offset.fetch_add(1, Ordering::Relaxed);
        let pick = |accept: &dyn Fn(&ServerEndpoint) -> bool| -> Option<Arc<ServerEndpoint>> {
            for i in 0..candidates.len() {
                let endpoint = candidates[(start + i) % candidates.len()];
                if accept(endpoint) {
                    return Some((*endpoint).clone());
                }
            }
            None
        };
        let exact = pick(&|e| e.is_connected() && e.state.role() == wanted);
        match preference {
            ServerPreference::DemandPrimary | ServerPreference::DemandReplica => {
                exact.ok_or(Error::NoServerAvailable)
            }
            _ => Ok(exact
                .or_else(|| pick(&|e| e.is_connected()))
                .unwrap_or_else(|| candidates[start % candidates.len()].clone())),
        }
    }

    fn subscription_target(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
    ) -> Result<(Arc<ServerEndpoint>, Arc<Bridge>)> {
        let endpoint = match kind {
            SubscriptionKind::Sharded => {
                // Sharded channels route like keys, by the wire channel name.
                let wire = self.shared.registry.wire_channel(channel);
                let slot = routing::hash_slot(&wire);
                self.select(Some(slot), ServerPreference::PreferPrimary)?
            }
            _ => self.select(None, ServerPreference::PreferPrimary)?,
        };
        let bridge = self.bridge_for_kind(&endpoint, kind);
        Ok((endpoint, bridge))
    }

    fn bridge_for_kind(&self, endpoint: &Arc<ServerEndpoint>, kind: SubscriptionKind) -> Arc<Bridge> {
        match kind {
            // Sharded pub/sub is RESP3-era and rides the interactive bridge.
            SubscriptionKind::Sharded => endpoint.interactive.clone(),
            _ => match &endpoint.subscription {
                Some(subscription) => subscription.clone(),
                None => endpoint.interactive.clone(),
            },
        }
    }
}

/// Administrative view of one endpoint (INFO, CLIENT LIST, counters),
/// reached without going through selection.
pub struct ServerHandle {
    endpoint: Arc<ServerEndpoint>,
}

impl ServerHandle {
    /// Issues a command directly on this endpoint's interactive bridge.
    pub async fn execute(&self, command: Cmd) -> Result<Reply> {
        // Pre-selecting the endpoint does not make a multi-slot command
        // routable; this node cannot own all of its keys.
        if command.is_cross_slot() {
            return Err(Error::CrossSlot);
        }
        let command = command.flags(CommandFlags::NO_REDIRECT);
        let reply = self.endpoint.interactive.execute(command).await?;
        if let Reply::Error(message) = reply.data() {
            return Err(Error::Server(message.clone()));
        }
        Ok(reply)
    }

    pub fn addr(&self) -> &EndpointAddr {
        self.endpoint.addr()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    pub fn role(&self) -> ServerRole {
        self.endpoint.state.role()
    }

    pub fn server_type(&self) -> ServerType {
        self.endpoint.state.server_type()
    }

    pub fn features(&self) -> Arc<Features> {
        self.endpoint.state.features()
    }

    pub fn client_id(&self) -> Option<i64> {
        self.endpoint.state.client_id()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.endpoint.interactive.counters.snapshot()
    }

    pub fn subscription_counters(&self) -> Option<CounterSnapshot> {
        self.endpoint
            .subscription
            .as_ref()
            .map(|bridge| bridge.counters.snapshot())
    }
}

fn admin_command_name(name: &[u8]) -> Option<&'static str> {
    const ADMIN: &[&str] = &[
        "FLUSHALL",
        "FLUSHDB",
        "SHUTDOWN",
        "DEBUG",
        "CONFIG",
        "REPLICAOF",
        "SLAVEOF",
        "SWAPDB",
        "SAVE",
        "BGSAVE",
        "BGREWRITEAOF",
        "RESET",
    ];
    ADMIN
        .iter()
        .find(|candidate| name.eq_ignore_ascii_case(candidate.as_bytes()))
        .copied()
}

fn subscriber_command_name(name: &[u8]) -> Option<&'static str> {
    const SUBSCRIBER: &[&str] = &[
        "SUBSCRIBE",
        "UNSUBSCRIBE",
        "PSUBSCRIBE",
        "PUNSUBSCRIBE",
        "SSUBSCRIBE",
        "SUNSUBSCRIBE",
    ];
    SUBSCRIBER
        .iter()
        .find(|candidate| name.eq_ignore_ascii_case(candidate.as_bytes()))
        .copied()
}

fn proxy_restricted_name(name: &[u8]) -> Option<&'static str> {
    const RESTRICTED: &[&str] = &[
        "SUBSCRIBE",
        "UNSUBSCRIBE",
        "PSUBSCRIBE",
        "PUNSUBSCRIBE",
        "SSUBSCRIBE",
        "SUNSUBSCRIBE",
        "MULTI",
        "EXEC",
        "WATCH",
        "UNWATCH",
        "DISCARD",
        "SELECT",
        "SCAN",
        "KEYS",
    ];
    RESTRICTED
        .iter()
        .find(|candidate| name.eq_ignore_ascii_case(candidate.as_bytes()))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_commands_are_gated_by_name() {
        assert_eq!(admin_command_name(b"flushall"), Some("FLUSHALL"));
        assert_eq!(admin_command_name(b"CONFIG"), Some("CONFIG"));
        assert_eq!(admin_command_name(b"GET"), None);
    }

    #[test]
    fn proxy_restrictions_cover_pubsub_and_transactions() {
        assert_eq!(proxy_restricted_name(b"subscribe"), Some("SUBSCRIBE"));
        assert_eq!(proxy_restricted_name(b"MULTI"), Some("MULTI"));
        assert_eq!(proxy_restricted_name(b"SET"), None);
    }

    #[test]
    fn subscriber_commands_are_reserved_for_the_registry() {
        assert_eq!(subscriber_command_name(b"SSUBSCRIBE"), Some("SSUBSCRIBE"));
        assert_eq!(subscriber_command_name(b"punsubscribe"), Some("PUNSUBSCRIBE"));
        assert_eq!(subscriber_command_name(b"PUBLISH"), None);
    }

    #[test]
    fn sentinel_peer_addr_parses_field_value_arrays() {
        let peer = Reply::Array(Some(vec![
            Reply::Bulk(Some(b"name".to_vec())),
            Reply::Bulk(Some(b"sentinel-2".to_vec())),
            Reply::Bulk(Some(b"ip".to_vec())),
            Reply::Bulk(Some(b"10.0.0.8".to_vec())),
            Reply::Bulk(Some(b"port".to_vec())),
            Reply::Bulk(Some(b"26379".to_vec())),
        ]));
        assert_eq!(
            sentinel_peer_addr(&peer),
            Some(EndpointAddr::new("10.0.0.8", 26379))
        );
        assert_eq!(sentinel_peer_addr(&Reply::Null), None);
    }
}

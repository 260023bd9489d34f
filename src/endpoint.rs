use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::bridge::{Bridge, BridgeRole};
use crate::cmd::{cmd, Cmd, CommandFlags};
use crate::config::EndpointAddr;
use crate::errors::{ConnectionFailureKind, Error, Result};
use crate::multiplexer::Shared;
use crate::slotmap::EndpointId;
use crate::types::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerRole {
    Unknown = 0,
    Primary = 1,
    Replica = 2,
}

impl ServerRole {
    fn from_u8(value: u8) -> ServerRole {
        match value {
            1 => ServerRole::Primary,
            2 => ServerRole::Replica,
            _ => ServerRole::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerType {
    Standalone = 0,
    Cluster = 1,
    Sentinel = 2,
    Proxy = 3,
}

impl ServerType {
    fn from_u8(value: u8) -> ServerType {
        match value {
            1 => ServerType::Cluster,
            2 => ServerType::Sentinel,
            3 => ServerType::Proxy,
            _ => ServerType::Standalone,
        }
    }
}

/// `major.minor.patch` as reported by the server. `UNKNOWN` (all zeros)
/// means the handshake could not learn a version; capability gates then
/// assume a modern server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ServerVersion(pub u16, pub u16, pub u16);

impl ServerVersion {
    pub const UNKNOWN: ServerVersion = ServerVersion(0, 0, 0);
}

impl FromStr for ServerVersion {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<ServerVersion, ()> {
        let mut parts = s.split('.').map(|p| p.parse::<u16>());
        let major = parts.next().and_then(|p| p.ok()).ok_or(())?;
        let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        Ok(ServerVersion(major, minor, patch))
    }
}

/// Capabilities learned during the handshake, immutable once cached.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub version: ServerVersion,
    pub resp3: bool,
    pub cluster_enabled: bool,
    pub databases: Option<i64>,
    pub maxmemory_policy: Option<String>,
}

impl Features {
    fn at_least(&self, version: ServerVersion) -> bool {
        self.version == ServerVersion::UNKNOWN || self.version >= version
    }

    pub fn supports_execabort(&self) -> bool {
        self.at_least(ServerVersion(2, 6, 5))
    }

    pub fn supports_scan(&self) -> bool {
        self.at_least(ServerVersion(2, 8, 0))
    }

    pub fn supports_hello(&self) -> bool {
        self.at_least(ServerVersion(6, 0, 0))
    }

    pub fn supports_sharded_pubsub(&self) -> bool {
        self.at_least(ServerVersion(7, 0, 0))
    }
}

/// Mutable per-endpoint facts shared by the endpoint's bridges. Bridges and
/// slot entries refer to the endpoint by id; this state carries what the
/// handshake and reply dispatch learn about the server behind the address.
pub(crate) struct EndpointState {
    pub(crate) id: EndpointId,
    pub(crate) addr: EndpointAddr,
    role: AtomicU8,
    server_type: AtomicU8,
    features: ArcSwap<Features>,
    auth_suspect: AtomicBool,
    client_id: AtomicI64,
}

impl EndpointState {
    pub(crate) fn new(id: EndpointId, addr: EndpointAddr) -> Arc<EndpointState> {
        Arc::new(EndpointState {
            id,
            addr,
            role: AtomicU8::new(ServerRole::Unknown as u8),
            server_type: AtomicU8::new(ServerType::Standalone as u8),
            features: ArcSwap::from_pointee(Features::default()),
            auth_suspect: AtomicBool::new(false),
            client_id: AtomicI64::new(-1),
        })
    }

    pub(crate) fn role(&self) -> ServerRole {
        ServerRole::from_u8(self.role.load(Ordering::Acquire))
    }

    pub(crate) fn set_role(&self, role: ServerRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub(crate) fn server_type(&self) -> ServerType {
        ServerType::from_u8(self.server_type.load(Ordering::Acquire))
    }

    pub(crate) fn set_server_type(&self, server_type: ServerType) {
        self.server_type.store(server_type as u8, Ordering::Release);
    }

    pub(crate) fn features(&self) -> Arc<Features> {
        self.features.load_full()
    }

    pub(crate) fn is_auth_suspect(&self) -> bool {
        self.auth_suspect.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_auth_suspect(&self) {
        self.auth_suspect.store(true, Ordering::Relaxed);
    }

    pub(crate) fn client_id(&self) -> Option<i64> {
        let id = self.client_id.load(Ordering::Relaxed);
        (id >= 0).then_some(id)
    }
}

/// A configured or discovered server: its state plus the bridge(s) carrying
/// traffic to it. Created once per address, destroyed at multiplexer
/// shutdown.
pub(crate) struct ServerEndpoint {
    pub(crate) state: Arc<EndpointState>,
    pub(crate) interactive: Arc<Bridge>,
    /// RESP2 only: subscriber mode takes over a connection, so pub/sub gets
    /// its own bridge. RESP3 carries pushes on the interactive bridge.
    pub(crate) subscription: Option<Arc<Bridge>>,
    /// Replica endpoints of this shard, when this endpoint is a cluster
    /// primary.
    pub(crate) replicas: Mutex<Vec<EndpointId>>,
}

impl ServerEndpoint {
    pub(crate) fn create(
        id: EndpointId,
        addr: EndpointAddr,
        shared: Arc<Shared>,
    ) -> Arc<ServerEndpoint> {
        let state = EndpointState::new(id, addr);
        let interactive = Bridge::new(BridgeRole::Interactive, state.clone(), shared.clone());
        let subscription = (!shared.options.resp3)
            .then(|| Bridge::new(BridgeRole::Subscription, state.clone(), shared));
        Arc::new(ServerEndpoint {
            state,
            interactive,
            subscription,
            replicas: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> EndpointId {
        self.state.id
    }

    pub(crate) fn addr(&self) -> &EndpointAddr {
        &self.state.addr
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.interactive.is_established()
    }

    pub(crate) fn set_replicas(&self, ids: Vec<EndpointId>) {
        *self.replicas.lock().unwrap() = ids;
    }

    pub(crate) fn replica_ids(&self) -> Vec<EndpointId> {
        self.replicas.lock().unwrap().clone()
    }
}

fn internal(command: Cmd) -> Cmd {
    command.flags(CommandFlags::INTERNAL_CALL)
}

fn is_unknown_command(message: &[u8]) -> bool {
    message.starts_with(b"ERR unknown command") || message.starts_with(b"ERR unknown subcommand")
}

fn auth_failure() -> Error {
    Error::connection(ConnectionFailureKind::AuthFailure)
}

/// The ordered handshake run on a freshly connected bridge, all commands
/// flagged internal so they bypass the backlog. Only a passing tracer marks
/// the bridge established; until then no user command is admitted.
pub(crate) async fn establish(bridge: &Arc<Bridge>) -> Result<()> {
    let options = &bridge.shared.options;
    let state = &bridge.endpoint;

    let mut features = Features::default();

    // 1. HELLO / AUTH ladder.
    if options.resp3 {
        match try_hello(bridge, &mut features).await? {
            HelloOutcome::Accepted => {}
            HelloOutcome::UnknownCommand => legacy_auth(bridge).await?,
        }
    } else if options.password.is_some() {
        legacy_auth(bridge).await?;
    }

    // 2. Database selection.
    if options.default_database != 0 && bridge.role == BridgeRole::Interactive {
        let reply = bridge
            .execute(internal(cmd("SELECT").arg(options.default_database)))
            .await?;
        if !reply.is_okay() {
            return Err(Error::Configuration(format!(
                "server refused SELECT {}",
                options.default_database
            )));
        }
    }

    // 3. Connection naming.
    if let Some(name) = &options.client_name {
        let reply = bridge
            .execute(internal(cmd("CLIENT").arg("SETNAME").arg(name)))
            .await?;
        if !reply.is_okay() {
            debug!(endpoint = %state.addr, "server refused CLIENT SETNAME");
        }
    }

    if bridge.role == BridgeRole::Interactive {
        // 4. CLIENT ID, recorded for redirection diagnostics. Pre-5.0
        // servers do not know it.
        if let Ok(reply) = bridge.execute(internal(cmd("CLIENT").arg("ID"))).await {
            if let Some(id) = reply.as_int() {
                state.client_id.store(id, Ordering::Relaxed);
            }
        }

        // 5. Capability and role probes.
        match state.server_type() {
            ServerType::Proxy => {}
            ServerType::Sentinel => {}
            _ => probe(bridge, &mut features).await?,
        }

        state.features.store(Arc::new(features));
    }

    // 6. Tracer; its reply is what proves the stream is aligned and live.
    // Sentinels and subscription bridges get PING (sentinels lack ECHO, and
    // subscriber mode restricts the command set).
    if bridge.role == BridgeRole::Interactive && state.server_type() != ServerType::Sentinel {
        let nonce = format!("handshake-{}", rand::random::<u32>());
        let reply = bridge.execute(internal(cmd("ECHO").arg(&nonce))).await?;
        if reply.as_bytes() != Some(nonce.as_bytes()) {
            return Err(Error::Protocol("handshake tracer mismatch".into()));
        }
    } else {
        let reply = bridge.execute(internal(cmd("PING"))).await?;
        if let Reply::Error(message) = reply.into_data() {
            return Err(Error::Server(message));
        }
    }

    debug!(endpoint = %state.addr, role = ?bridge.role, "handshake complete");
    Ok(())
}

enum HelloOutcome {
    Accepted,
    UnknownCommand,
}

async fn try_hello(bridge: &Arc<Bridge>, features: &mut Features) -> Result<HelloOutcome> {
    let options = &bridge.shared.options;
    let mut hello = cmd("HELLO").arg(3_i64);
    if let Some(password) = &options.password {
        let username = options.username.as_deref().unwrap_or("default");
        hello = hello.arg("AUTH").arg(username).arg(password);
    }
    let reply = bridge.execute(internal(hello)).await?;
    match reply.into_data() {
        Reply::Error(message) => {
            if is_unknown_command(&message) {
                return Ok(HelloOutcome::UnknownCommand);
            }
            warn!(
                endpoint = %bridge.endpoint.addr,
                error = %String::from_utf8_lossy(&message),
                "HELLO rejected",
            );
            Err(auth_failure())
        }
        Reply::Map(pairs) => {
            features.resp3 = true;
            for (key, value) in &pairs {
                if key.as_bytes() == Some(b"version") {
                    if let Some(text) = value.as_text() {
                        if let Ok(version) = text.parse() {
                            features.version = version;
                        }
                    }
                }
            }
            Ok(HelloOutcome::Accepted)
        }
        // RESP2-shaped HELLO reply (field/value array) from a server that
        // accepted the command but kept protocol 2 framing.
        other => {
            if let Some(items) = other.as_items() {
                let mut iter = items.iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    if key.as_bytes() == Some(b"version") {
                        if let Some(text) = value.as_text() {
                            if let Ok(version) = text.parse() {
                                features.version = version;
                            }
                        }
                    }
                }
                features.resp3 = true;
                Ok(HelloOutcome::Accepted)
            } else {
                Err(Error::Protocol("unexpected HELLO reply shape".into()))
            }
        }
    }
}

/// `AUTH user pass`, falling back to the single-argument form on servers
/// that predate ACLs.
async fn legacy_auth(bridge: &Arc<Bridge>) -> Result<()> {
    let options = &bridge.shared.options;
    let Some(password) = options.password.clone() else {
        return Ok(());
    };
    let mut auth = cmd("AUTH");
    if let Some(username) = &options.username {
        auth = auth.arg(username);
    }
    let reply = bridge.execute(internal(auth.arg(&password))).await?;
    match reply.into_data() {
        reply if reply.is_okay() => Ok(()),
        Reply::Error(message) => {
            if !String::from_utf8_lossy(&message).contains("wrong number of arguments") {
                return Err(auth_failure());
            }
            let retry = bridge.execute(internal(cmd("AUTH").arg(&password))).await?;
            if retry.is_okay() {
                Ok(())
            } else {
                Err(auth_failure())
            }
        }
        _ => Err(auth_failure()),
    }
}

/// Role and capability probes. `INFO REPLICATION` decides primary/replica;
/// the CONFIG probes are tolerated failures because proxies and restricted
/// deployments reject them.
async fn probe(bridge: &Arc<Bridge>, features: &mut Features) -> Result<()> {
    let state = &bridge.endpoint;

    let info = bridge
        .execute(internal(cmd("INFO").arg("REPLICATION")))
        .await?;
    if let Reply::Error(message) = info.data() {
        if message.starts_with(b"NOAUTH") || message.starts_with(b"WRONGPASS") {
            return Err(auth_failure());
        }
        return Err(Error::Server(message.clone()));
    }
    if let Some(text) = info.as_text() {
        apply_info_replication(state, features, &text);
    }

    if let Ok(reply) = bridge
        .execute(internal(cmd("CONFIG").arg("GET").arg("databases")))
        .await
    {
        if let Some(items) = reply.as_items() {
            if let Some(count) = items.get(1).and_then(|v| {
                v.as_int()
                    .or_else(|| v.as_text().and_then(|t| t.parse().ok()))
            }) {
                features.databases = Some(count);
            }
        }
    }

    if let Ok(reply) = bridge
        .execute(internal(cmd("CONFIG").arg("GET").arg("maxmemory-policy")))
        .await
    {
        if let Some(items) = reply.as_items() {
            features.maxmemory_policy = items.get(1).and_then(|v| v.as_text());
        }
    }

    // Cluster is probed directly: non-cluster servers answer CLUSTER NODES
    // with an error, which settles the question either way.
    let nodes = bridge.execute(internal(cmd("CLUSTER").arg("NODES"))).await?;
    match nodes.data() {
        Reply::Error(_) => {
            features.cluster_enabled = false;
        }
        _ => {
            features.cluster_enabled = true;
            state.set_server_type(ServerType::Cluster);
        }
    }

    Ok(())
}

pub(crate) fn apply_info_replication(state: &EndpointState, features: &mut Features, text: &str) {
    for line in text.lines() {
        let line = line.trim();
        if let Some(role) = line.strip_prefix("role:") {
            match role {
                "master" => state.set_role(ServerRole::Primary),
                "slave" | "replica" => state.set_role(ServerRole::Replica),
                _ => {}
            }
        } else if let Some(version) = line.strip_prefix("redis_version:") {
            if let Ok(version) = version.parse() {
                features.version = version;
            }
        } else if let Some(flag) = line.strip_prefix("cluster_enabled:") {
            features.cluster_enabled = flag == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing_and_ordering() {
        let v: ServerVersion = "7.2.4".parse().unwrap();
        assert_eq!(v, ServerVersion(7, 2, 4));
        assert!(v > ServerVersion(6, 2, 14));
        assert!("6".parse::<ServerVersion>().unwrap() == ServerVersion(6, 0, 0));
        assert!("x.y".parse::<ServerVersion>().is_err());
    }

    #[test]
    fn feature_gates() {
        let old = Features {
            version: ServerVersion(2, 4, 0),
            ..Features::default()
        };
        assert!(!old.supports_execabort());
        assert!(!old.supports_sharded_pubsub());

        let modern = Features {
            version: ServerVersion(7, 0, 0),
            ..Features::default()
        };
        assert!(modern.supports_execabort());
        assert!(modern.supports_sharded_pubsub());

        // Unknown version assumes a modern server.
        assert!(Features::default().supports_execabort());
    }

    #[test]
    fn info_replication_parse() {
        let state = EndpointState::new(EndpointId(0), EndpointAddr::new("h", 6379));
        let mut features = Features::default();
        apply_info_replication(
            &state,
            &mut features,
            "# Replication\r\nrole:master\r\nconnected_slaves:1\r\nredis_version:7.0.11\r\ncluster_enabled:0\r\n",
        );
        assert_eq!(state.role(), ServerRole::Primary);
        assert_eq!(features.version, ServerVersion(7, 0, 11));
        assert!(!features.cluster_enabled);

        apply_info_replication(&state, &mut features, "role:slave\r\n");
        assert_eq!(state.role(), ServerRole::Replica);
    }
}

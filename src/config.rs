use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::errors::{Error, Result};

pub(crate) const DEFAULT_PORT: u16 = 6379;

/// A configured or discovered server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn new(host: impl Into<String>, port: u16) -> EndpointAddr {
        EndpointAddr {
            host: host.into(),
            port,
        }
    }

    fn parse(item: &str) -> Result<EndpointAddr> {
        let item = item.trim();
        match item.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Configuration(format!("invalid port in endpoint `{item}`"))
                })?;
                Ok(EndpointAddr::new(host, port))
            }
            _ => {
                if item.is_empty() {
                    return Err(Error::Configuration("empty endpoint".into()));
                }
                Ok(EndpointAddr::new(item, DEFAULT_PORT))
            }
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Intermediary the deployment sits behind, limiting the usable command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyKind {
    #[default]
    None,
    Twemproxy,
    Envoyproxy,
}

/// Parsed connection options. Construction-time only; nothing here changes
/// over the multiplexer's lifetime.
#[derive(Debug, Clone)]
pub struct Options {
    pub endpoints: Vec<EndpointAddr>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_ssl: bool,
    pub ssl_host: Option<String>,
    pub abort_connect: bool,
    pub allow_admin: bool,
    pub sync_timeout: Duration,
    pub async_timeout: Duration,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub default_database: i16,
    pub service_name: Option<String>,
    /// Key consulted to resolve a split-brain between two primaries.
    /// `None` disables the probe.
    pub tie_breaker: Option<String>,
    pub channel_prefix: Option<Vec<u8>>,
    pub proxy: ProxyKind,
    pub resp3: bool,
    pub client_name: Option<String>,
    /// Cadence of the heartbeat/sweeper tick.
    pub heartbeat_interval: Duration,
    /// Hard cap on queued-but-unsent commands per bridge.
    pub backlog_limit: usize,
    /// How long a backlog entry may wait out a disconnect before failing.
    /// Zero fails backlogged work immediately when the connection drops.
    pub backlog_disconnect_timeout: Duration,
    pub redirect_limit: u8,
    pub cancel_on_timeout: bool,
    pub max_frame_len: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            endpoints: Vec::new(),
            username: None,
            password: None,
            use_ssl: false,
            ssl_host: None,
            abort_connect: true,
            allow_admin: false,
            sync_timeout: Duration::from_secs(5),
            async_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
            default_database: 0,
            service_name: None,
            tie_breaker: Some("__Booksleeve_TieBreak".to_owned()),
            channel_prefix: None,
            proxy: ProxyKind::None,
            resp3: false,
            client_name: None,
            heartbeat_interval: Duration::from_secs(1),
            backlog_limit: 1 << 20,
            backlog_disconnect_timeout: Duration::ZERO,
            redirect_limit: 5,
            cancel_on_timeout: false,
            max_frame_len: crate::codec::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Configuration(format!(
            "option `{key}` expects a boolean, got `{value}`"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| {
        Error::Configuration(format!("option `{key}` expects an integer, got `{value}`"))
    })
}

impl Options {
    /// Parses the comma-separated connection grammar: `host[:port]` items add
    /// endpoints, `key=value` items set named options. Unknown keys are
    /// accepted with a warning as a forward-compat contract.
    pub fn parse(config: &str) -> Result<Options> {
        let mut options = Options::default();
        for item in config.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let Some((key, value)) = item.split_once('=') else {
                let endpoint = EndpointAddr::parse(item)?;
                if !options.endpoints.contains(&endpoint) {
                    options.endpoints.push(endpoint);
                }
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "user" => options.username = Some(value.to_owned()),
                "password" => options.password = Some(value.to_owned()),
                "ssl" => options.use_ssl = parse_bool(key, value)?,
                "sslHost" => options.ssl_host = Some(value.to_owned()),
                "abortConnect" => options.abort_connect = parse_bool(key, value)?,
                "allowAdmin" => options.allow_admin = parse_bool(key, value)?,
                "syncTimeout" => {
                    options.sync_timeout = Duration::from_millis(parse_u64(key, value)?)
                }
                "asyncTimeout" => {
                    options.async_timeout = Duration::from_millis(parse_u64(key, value)?)
                }
                "connectTimeout" => {
                    options.connect_timeout = Duration::from_millis(parse_u64(key, value)?)
                }
                "keepAlive" => options.keep_alive = Duration::from_secs(parse_u64(key, value)?),
                "defaultDatabase" => {
                    options.default_database = value.parse::<i16>().map_err(|_| {
                        Error::Configuration(format!("invalid defaultDatabase `{value}`"))
                    })?
                }
                "serviceName" => options.service_name = Some(value.to_owned()),
                "tieBreaker" => {
                    options.tie_breaker = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_owned())
                    }
                }
                "channelPrefix" => {
                    options.channel_prefix = if value.is_empty() {
                        None
                    } else {
                        Some(value.as_bytes().to_vec())
                    }
                }
                "proxy" => {
                    options.proxy = match value {
                        "twemproxy" => ProxyKind::Twemproxy,
                        "envoyproxy" => ProxyKind::Envoyproxy,
                        _ => {
                            return Err(Error::Configuration(format!(
                                "unknown proxy kind `{value}`"
                            )));
                        }
                    }
                }
                "resp3" => options.resp3 = parse_bool(key, value)?,
                "name" => options.client_name = Some(value.to_owned()),
                _ => {
                    warn!(key, value, "ignoring unrecognised configuration option");
                }
            }
        }
        if options.endpoints.is_empty() {
            return Err(Error::Configuration(
                "connection string names no endpoints".into(),
            ));
        }
        Ok(options)
    }
}

impl FromStr for Options {
    type Err = Error;

    fn from_str(s: &str) -> Result<Options> {
        Options::parse(s)
    }
}

/// A source of option overrides, matched against the configured endpoints.
/// Providers are tried in order; the first whose `is_match` returns true
/// applies only the overrides it cares about, on top of parsed values and
/// hard-coded defaults.
pub trait OptionsProvider: Send + Sync {
    fn is_match(&self, endpoints: &[EndpointAddr]) -> bool;
    fn apply(&self, options: &mut Options);
}

/// Terminal provider: matches everything, overrides nothing.
#[derive(Debug, Default)]
pub struct DefaultOptionsProvider;

impl OptionsProvider for DefaultOptionsProvider {
    fn is_match(&self, _endpoints: &[EndpointAddr]) -> bool {
        true
    }

    fn apply(&self, _options: &mut Options) {}
}

pub(crate) fn apply_providers(options: &mut Options, providers: &[Box<dyn OptionsProvider>]) {
    let endpoints = options.endpoints.clone();
    for provider in providers {
        if provider.is_match(&endpoints) {
            provider.apply(options);
            return;
        }
    }
}

//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    AnalyticsArgs, CliArgs, Command, DatabaseOverride, PurgeUsageArgs, ServeArgs, ServeOverrides,
};

use std::{
    collections::HashMap,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::quota::{FailurePolicy, GUEST_TIER, QuotaPolicy, TierTable};
use crate::cache::{EvictionPolicy, TtlClass};
use crate::domain::quota::{BucketLimits, Tier};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tollgate";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_USAGE_RETENTION_DAYS: u64 = 30;
const DEFAULT_QUOTA_SWEEP_SECS: u64 = 60 * 60;
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1_000;
const DEFAULT_CACHE_MAX_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_CACHE_METADATA_TTL_SECS: u64 = 5 * 60;
const DEFAULT_CACHE_CONTENT_TTL_SECS: u64 = 60 * 60;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEFAULT_ROUTE_COST: u64 = 1;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub quota: QuotaSettings,
    pub cache: CacheSettings,
    pub routes: Vec<GovernedRoute>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// `None` selects the in-memory store.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct QuotaSettings {
    pub policy: QuotaPolicy,
    /// Interval of the usage retention sweep.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: NonZeroUsize,
    pub max_size_bytes: NonZeroU64,
    pub metadata_ttl: Duration,
    pub content_ttl: Duration,
    pub eviction_policy: EvictionPolicy,
    pub sweep_interval: Duration,
}

/// A path prefix governed by the admission layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernedRoute {
    pub prefix: String,
    pub action: String,
    pub cost: u64,
    pub ttl: TtlClass,
    pub cacheable: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("TOLLGATE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("quota.operators")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Analytics(args)) => raw.apply_database_override(&args.database),
        Some(Command::PurgeUsage(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    quota: RawQuotaSettings,
    cache: RawCacheSettings,
    routes: Vec<RawRoute>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(policy) = overrides.quota_failure_policy.as_ref() {
            self.quota.failure_policy = Some(policy.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(max) = overrides.cache_max_size_bytes {
            self.cache.max_size_bytes = Some(max);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            quota,
            cache,
            routes,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let quota = build_quota_settings(quota)?;
        let cache = build_cache_settings(cache)?;
        let routes = build_routes(routes)?;

        Ok(Self {
            server,
            logging,
            database,
            quota,
            cache,
            routes,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_quota_settings(quota: RawQuotaSettings) -> Result<QuotaSettings, LoadError> {
    let reference = QuotaPolicy::reference();

    let tiers = if quota.tiers.is_empty() {
        if quota.default_tier.as_deref().is_some_and(|name| name != GUEST_TIER) {
            return Err(LoadError::invalid(
                "quota.default_tier",
                "custom default tier requires `quota.tiers`",
            ));
        }
        reference.tiers
    } else {
        let tiers = quota
            .tiers
            .into_iter()
            .map(|raw| Tier {
                name: raw.name,
                limits: BucketLimits {
                    capacity: raw.capacity,
                    refill_rate: raw.refill_rate,
                    max_burst: raw.max_burst.unwrap_or(raw.capacity),
                },
                priority: raw.priority,
            })
            .collect();
        let default_tier = quota.default_tier.unwrap_or_else(|| GUEST_TIER.to_string());
        TierTable::new(tiers, default_tier)
            .map_err(|err| LoadError::invalid("quota.tiers", err.to_string()))?
    };

    let mut global_limits = reference.global_limits;
    for (action, raw) in quota.global_limits {
        let limits = BucketLimits::new(
            raw.capacity,
            raw.refill_rate,
            raw.max_burst.unwrap_or(raw.capacity),
        )
        .map_err(|err| {
            LoadError::invalid("quota.global_limits", format!("action `{action}`: {err}"))
        })?;
        global_limits.insert(action, limits);
    }

    let failure_policy = match quota.failure_policy {
        Some(value) => FailurePolicy::from_str(&value)
            .map_err(|reason| LoadError::invalid("quota.failure_policy", reason))?,
        None => FailurePolicy::default(),
    };

    let retention_days = quota
        .usage_retention_days
        .unwrap_or(DEFAULT_USAGE_RETENTION_DAYS);
    if retention_days == 0 {
        return Err(LoadError::invalid(
            "quota.usage_retention_days",
            "must be greater than zero",
        ));
    }

    let sweep_interval = positive_seconds(
        quota.sweep_interval_seconds,
        DEFAULT_QUOTA_SWEEP_SECS,
        "quota.sweep_interval_seconds",
    )?;

    Ok(QuotaSettings {
        policy: QuotaPolicy {
            tiers,
            global_limits,
            failure_policy,
            usage_retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            operators: quota.operators,
            assignments: quota.assignments,
        },
        sweep_interval,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries_value = cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES);
    let max_entries = usize::try_from(max_entries_value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid("cache.max_entries", "must be a positive count within range")
        })?;

    let max_size_bytes = NonZeroU64::new(
        cache
            .max_size_bytes
            .unwrap_or(DEFAULT_CACHE_MAX_SIZE_BYTES),
    )
    .ok_or_else(|| LoadError::invalid("cache.max_size_bytes", "must be greater than zero"))?;

    let eviction_policy = match cache.eviction_policy.as_deref() {
        None | Some("scored") => EvictionPolicy::Scored,
        Some("lru") => EvictionPolicy::Lru,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.eviction_policy",
                format!("unknown policy `{other}`, expected `scored` or `lru`"),
            ));
        }
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        max_entries,
        max_size_bytes,
        metadata_ttl: positive_seconds(
            cache.metadata_ttl_seconds,
            DEFAULT_CACHE_METADATA_TTL_SECS,
            "cache.metadata_ttl_seconds",
        )?,
        content_ttl: positive_seconds(
            cache.content_ttl_seconds,
            DEFAULT_CACHE_CONTENT_TTL_SECS,
            "cache.content_ttl_seconds",
        )?,
        eviction_policy,
        sweep_interval: positive_seconds(
            cache.sweep_interval_seconds,
            DEFAULT_CACHE_SWEEP_SECS,
            "cache.sweep_interval_seconds",
        )?,
    })
}

fn build_routes(routes: Vec<RawRoute>) -> Result<Vec<GovernedRoute>, LoadError> {
    routes
        .into_iter()
        .map(|raw| {
            if !raw.prefix.starts_with('/') {
                return Err(LoadError::invalid(
                    "routes.prefix",
                    format!("`{}` must start with `/`", raw.prefix),
                ));
            }
            if raw.action.trim().is_empty() {
                return Err(LoadError::invalid(
                    "routes.action",
                    format!("route `{}` has an empty action", raw.prefix),
                ));
            }

            let ttl = match (raw.ttl.as_deref(), raw.ttl_seconds) {
                (_, Some(0)) => {
                    return Err(LoadError::invalid(
                        "routes.ttl_seconds",
                        "must be greater than zero",
                    ));
                }
                (_, Some(seconds)) => TtlClass::Custom(Duration::from_secs(seconds)),
                (None | Some("metadata"), None) => TtlClass::Metadata,
                (Some("content"), None) => TtlClass::Content,
                (Some(other), None) => {
                    return Err(LoadError::invalid(
                        "routes.ttl",
                        format!("unknown ttl class `{other}`, expected `metadata` or `content`"),
                    ));
                }
            };

            Ok(GovernedRoute {
                prefix: raw.prefix,
                action: raw.action,
                cost: raw.cost.unwrap_or(DEFAULT_ROUTE_COST),
                ttl,
                cacheable: raw.cacheable.unwrap_or(true),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuotaSettings {
    failure_policy: Option<String>,
    default_tier: Option<String>,
    usage_retention_days: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    tiers: Vec<RawTier>,
    global_limits: HashMap<String, RawLimits>,
    operators: Vec<String>,
    assignments: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTier {
    name: String,
    capacity: u64,
    refill_rate: u64,
    max_burst: Option<u64>,
    priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct RawLimits {
    capacity: u64,
    refill_rate: u64,
    max_burst: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    max_entries: Option<u64>,
    max_size_bytes: Option<u64>,
    metadata_ttl_seconds: Option<u64>,
    content_ttl_seconds: Option<u64>,
    eviction_policy: Option<String>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRoute {
    prefix: String,
    action: String,
    cost: Option<u64>,
    ttl: Option<String>,
    ttl_seconds: Option<u64>,
    cacheable: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_seconds(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        seconds => Ok(Duration::from_secs(seconds)),
    }
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

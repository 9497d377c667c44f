//! Cache configuration.
//!
//! Controls the response cache via the `[cache]` section of `tollgate.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_MAX_ENTRIES: usize = 1_000;
const DEFAULT_MAX_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_METADATA_TTL_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_CONTENT_TTL_MS: u64 = 60 * 60 * 1_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60 * 1_000;

/// How a full cache picks its victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Lowest `created_at + hit_count * 1000` goes first.
    #[default]
    Scored,
    /// Least recently read or written goes first.
    Lru,
}

impl EvictionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionPolicy::Scored => "scored",
            EvictionPolicy::Lru => "lru",
        }
    }
}

/// Freshness class of a cached response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Cheap lookups that go stale quickly.
    Metadata,
    /// Expensive generated content.
    Content,
    Custom(Duration),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to bypass lookups and stores entirely.
    pub enabled: bool,
    pub max_entries: usize,
    /// Upper bound on the summed body sizes.
    pub max_size_bytes: u64,
    pub metadata_ttl_ms: u64,
    pub content_ttl_ms: u64,
    pub eviction_policy: EvictionPolicy,
    /// Interval of the background expiry sweep.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            metadata_ttl_ms: DEFAULT_METADATA_TTL_MS,
            content_ttl_ms: DEFAULT_CONTENT_TTL_MS,
            eviction_policy: EvictionPolicy::Scored,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries.get(),
            max_size_bytes: settings.max_size_bytes.get(),
            metadata_ttl_ms: settings.metadata_ttl.as_millis() as u64,
            content_ttl_ms: settings.content_ttl.as_millis() as u64,
            eviction_policy: settings.eviction_policy,
            sweep_interval_ms: settings.sweep_interval.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Metadata => Duration::from_millis(self.metadata_ttl_ms),
            TtlClass::Content => Duration::from_millis(self.content_ttl_ms),
            TtlClass::Custom(ttl) => ttl,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_entries, 1_000);
        assert_eq!(config.max_size_bytes, 50 * 1024 * 1024);
        assert_eq!(config.eviction_policy, EvictionPolicy::Scored);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn ttl_classes_resolve() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_for(TtlClass::Metadata), Duration::from_secs(300));
        assert_eq!(config.ttl_for(TtlClass::Content), Duration::from_secs(3_600));
        assert_eq!(
            config.ttl_for(TtlClass::Custom(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }
}

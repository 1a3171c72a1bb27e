use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Local (in-process) result consumption
    #[serde(default)]
    pub local: LocalResultConfig,
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Socket buffering and write coalescing
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Size of one pooled read block (bytes)
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Blocks kept cached for reuse
    #[serde(default = "default_max_pooled_blocks")]
    pub max_pooled_blocks: usize,
    /// Free capacity below which the read block is swapped
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: usize,
    /// Largest logical packet accepted, in wire bytes across all chunks
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Queued writes smaller than this are merged into one chunk
    #[serde(default = "default_coalesce_threshold")]
    pub coalesce_threshold: usize,
}

fn default_block_size() -> usize {
    64 * 1024
}

fn default_max_pooled_blocks() -> usize {
    256
}

fn default_low_water_mark() -> usize {
    4096
}

fn default_max_packet_size() -> usize {
    64 * 1024 * 1024
}

fn default_coalesce_threshold() -> usize {
    8192
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_pooled_blocks: default_max_pooled_blocks(),
            low_water_mark: default_low_water_mark(),
            max_packet_size: default_max_packet_size(),
            coalesce_threshold: default_coalesce_threshold(),
        }
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Transparent replay of discarded results
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,
    /// Replay is no longer attempted once the logical request is older than this (milliseconds)
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Attempts that use the short delay
    #[serde(default = "default_fast_attempts")]
    pub fast_attempts: u32,
    #[serde(default = "default_fast_delay_ms")]
    pub fast_delay_ms: u64,
    #[serde(default = "default_slow_delay_ms")]
    pub slow_delay_ms: u64,
    /// Upper bound of the random delay added to each attempt (milliseconds)
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_retry_enabled() -> bool {
    true
}

fn default_deadline_ms() -> u64 {
    5000
}

fn default_fast_attempts() -> u32 {
    3
}

fn default_fast_delay_ms() -> u64 {
    10
}

fn default_slow_delay_ms() -> u64 {
    100
}

fn default_jitter_ms() -> u64 {
    5
}

impl RetryConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Base delay before replay number `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt <= self.fast_attempts {
            Duration::from_millis(self.fast_delay_ms)
        } else {
            Duration::from_millis(self.slow_delay_ms)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_retry_enabled(),
            deadline_ms: default_deadline_ms(),
            fast_attempts: default_fast_attempts(),
            fast_delay_ms: default_fast_delay_ms(),
            slow_delay_ms: default_slow_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

// ============================================================================
// Local Result Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LocalResultConfig {
    /// Bounded wait of a synchronous row read (milliseconds)
    #[serde(default = "default_row_wait_timeout_ms")]
    pub row_wait_timeout_ms: u64,
}

fn default_row_wait_timeout_ms() -> u64 {
    30_000
}

impl LocalResultConfig {
    pub fn row_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.row_wait_timeout_ms)
    }
}

impl Default for LocalResultConfig {
    fn default() -> Self {
        Self {
            row_wait_timeout_ms: default_row_wait_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.transport.block_size, 64 * 1024);
        assert_eq!(config.transport.max_packet_size, 64 * 1024 * 1024);
        assert!(config.retry.enabled); // default
        assert_eq!(config.retry.deadline_ms, 5000);
        assert_eq!(config.local.row_wait_timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml = r#"
[transport]
block_size = 16384
low_water_mark = 1024

[retry]
enabled = false
fast_attempts = 1
slow_delay_ms = 250
"#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.transport.block_size, 16384);
        assert_eq!(config.transport.low_water_mark, 1024);
        assert_eq!(config.transport.coalesce_threshold, 8192); // default
        assert!(!config.retry.enabled);
        assert_eq!(config.retry.fast_delay_ms, 10); // default
        assert_eq!(config.retry.base_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry.base_delay(2), Duration::from_millis(250));
    }

    #[test]
    fn test_reject_wrong_type() {
        let toml = r#"
[retry]
deadline_ms = "soon"
"#;
        assert!(toml::from_str::<RelayConfig>(toml).is_err());
    }
}

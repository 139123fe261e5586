//! Tunable parameters for the key store.
//!
//! These correspond to the `net.key` sysctl knobs of the classic
//! implementations; defaults match theirs.

use serde::{Deserialize, Serialize};

/// Configuration for a [`KeyStoreContext`](crate::KeyStoreContext).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Max attempts when searching for an unused SPI or policy id.
    pub spi_trycnt: u32,
    /// Minimum SPI value for automatic allocation.
    pub spi_minval: u32,
    /// Maximum SPI value for automatic allocation.
    pub spi_maxval: u32,
    /// Seconds a LARVAL SA may exist before the sweeper reaps it.
    pub larval_lifetime: u64,
    /// Acquire retries suppressed before a fresh negotiation request is sent.
    pub blockacq_count: u32,
    /// Seconds an acquire record lives without a response.
    pub blockacq_lifetime: u64,
    /// Prefer the oldest usable SA for outbound traffic (rekeying draft
    /// behavior); `false` prefers the newest.
    pub preferred_oldsa: bool,
    /// Minimum ESP encryption key size in bits for proposals.
    pub esp_keymin: u16,
    /// Pair ESP proposals with authentication combinations.
    pub esp_auth: bool,
    /// Minimum AH authentication key size in bits for proposals.
    pub ah_keymin: u16,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            spi_trycnt: 1000,
            spi_minval: 0x100,
            spi_maxval: 0x0fff_ffff,
            larval_lifetime: 30,
            blockacq_count: 10,
            blockacq_lifetime: 20,
            preferred_oldsa: true,
            esp_keymin: 256,
            esp_auth: false,
            ah_keymin: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KeyConfig::default();
        assert_eq!(cfg.spi_minval, 0x100);
        assert_eq!(cfg.spi_maxval, 0x0fff_ffff);
        assert_eq!(cfg.larval_lifetime, 30);
        assert!(cfg.preferred_oldsa);
    }

    #[test]
    fn test_roundtrip_json() {
        let cfg = KeyConfig::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let back: KeyConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.blockacq_count, cfg.blockacq_count);
        assert_eq!(back.esp_keymin, cfg.esp_keymin);
    }

    #[test]
    fn test_partial_config() {
        let back: KeyConfig = serde_json::from_str(r#"{"spi_trycnt": 5}"#).unwrap();
        assert_eq!(back.spi_trycnt, 5);
        assert_eq!(back.ah_keymin, 128);
    }
}

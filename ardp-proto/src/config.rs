//! Engine configuration.

/// Global configuration for an [`crate::ArdpEngine`].
///
/// All values are milliseconds unless noted. The defaults reproduce the
/// protocol's standard timing: retransmissions every 500 ms (urgent quarter
/// interval after a blocked socket), a 5 s persist/keep-alive probe, a link
/// declared dead after ten silent probe intervals, and a 1 s close-wait
/// grace period.
#[derive(Debug, Clone)]
pub struct ArdpConfig {
    /// Handshake must complete within this long or the connection fails.
    pub connect_timeout_ms: u32,

    /// Grace period spent in CLOSE_WAIT before the record is destroyed.
    pub timewait_ms: u32,

    /// Silence interval after which a NUL keep-alive probe is emitted.
    pub persist_timeout_ms: u32,

    /// Base probe interval; the link is declared dead after ten of these
    /// without hearing from the peer.
    pub probe_timeout_ms: u32,

    /// Initial retransmission timeout for data segments.
    pub retransmit_timeout_ms: u32,

    /// Delay before re-attempting a delivery the consumer refused.
    pub recv_timeout_ms: u32,

    /// Largest message the engine must be able to keep in flight; determines
    /// the minimum usable peer window (`ceil(max_message_len / max_dlen)`).
    pub max_message_len: u32,
}

impl Default for ArdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            timewait_ms: 1_000,
            persist_timeout_ms: 5_000,
            probe_timeout_ms: 2_500,
            retransmit_timeout_ms: 500,
            recv_timeout_ms: 300,
            max_message_len: 131_072,
        }
    }
}

impl ArdpConfig {
    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.connect_timeout_ms == 0 {
            errors.push("connect_timeout_ms must be nonzero".to_string());
        }
        if self.retransmit_timeout_ms < 4 {
            errors.push("retransmit_timeout_ms must be at least 4 ms".to_string());
        }
        if self.recv_timeout_ms == 0 {
            errors.push("recv_timeout_ms must be nonzero".to_string());
        }
        if self.persist_timeout_ms == 0 {
            errors.push("persist_timeout_ms must be nonzero".to_string());
        }
        if self.probe_timeout_ms == 0 {
            errors.push("probe_timeout_ms must be nonzero".to_string());
        }
        if self.max_message_len == 0 {
            errors.push("max_message_len must be nonzero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Retransmit interval used while the socket is refusing writes.
    pub(crate) fn urgent_retransmit_ms(&self) -> u32 {
        self.retransmit_timeout_ms / 4
    }

    /// Silence threshold after which the peer is considered unreachable.
    pub(crate) fn link_timeout_ms(&self) -> u32 {
        self.probe_timeout_ms.saturating_mul(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ArdpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.urgent_retransmit_ms(), 125);
        assert_eq!(config.link_timeout_ms(), 25_000);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ArdpConfig {
            connect_timeout_ms: 0,
            recv_timeout_ms: 0,
            ..ArdpConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_link_timeout_matches_window_check_multiple() {
        // Default probe interval keeps the documented identity
        // link_timeout == 5 * persist_timeout.
        let config = ArdpConfig::default();
        assert_eq!(config.link_timeout_ms(), 5 * config.persist_timeout_ms);
    }
}

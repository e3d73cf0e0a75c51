//! Flash tool configuration
//!
//! [FlashConfig] has a fixed schema. It can be built from defaults, from an explicit key/value
//! map with [FlashConfig::from_pairs], or (with the `serde` feature) deserialized.

use std::{str::FromStr, sync::Arc, time::Duration};

use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    channel::FrameChannel,
    flash::{ErasePolicy, FlashOptions, BOOTLOADER_ADDRESS, PROBE_DID},
    kwp2000::{KwpClient, ResponsePolicy, SecurityLevel},
    listener::{Listener, DEFAULT_QUEUE_DEPTH},
    segmented::SegmentedCodec,
    session::{SessionManager, SessionOptions},
    DiagResult,
};

/// Keys accepted by [FlashConfig::from_pairs]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ConfigKey {
    /// [FlashConfig::request_id]
    RequestId,
    /// [FlashConfig::response_id]
    ResponseId,
    /// [FlashConfig::read_timeout_ms]
    ReadTimeoutMs,
    /// [FlashConfig::flow_control_timeout_ms]
    FlowControlTimeoutMs,
    /// [FlashConfig::pending_multiplier]
    PendingMultiplier,
    /// [FlashConfig::max_pending_extensions]
    MaxPendingExtensions,
    /// [FlashConfig::busy_retries]
    BusyRetries,
    /// [FlashConfig::busy_delay_ms]
    BusyDelayMs,
    /// [FlashConfig::sequence_retries]
    SequenceRetries,
    /// [FlashConfig::keep_alive_period_ms]
    KeepAlivePeriodMs,
    /// [FlashConfig::block_retry_budget]
    BlockRetryBudget,
    /// [FlashConfig::erase_timeout_ms]
    EraseTimeoutMs,
    /// [FlashConfig::erase_inactivity_ms]
    EraseInactivityMs,
    /// [FlashConfig::security_attempts]
    SecurityAttempts,
    /// [FlashConfig::security_delay_ms]
    SecurityDelayMs,
    /// [FlashConfig::bootloader_level]
    BootloaderLevel,
    /// [FlashConfig::bootloader_address]
    BootloaderAddress,
    /// [FlashConfig::read_chunk]
    ReadChunk,
    /// [FlashConfig::probe_did]
    ProbeDid,
    /// [FlashConfig::listener_depth]
    ListenerDepth,
}

#[derive(Debug, thiserror::Error)]
/// Error produced parsing a configuration map
pub enum ConfigError {
    /// Key is not part of the schema
    #[error("Unknown configuration key '{0}'")]
    UnknownKey(String),
    /// Value could not be parsed for its key
    #[error("Invalid value '{value}' for '{key}'")]
    InvalidValue {
        /// Key
        key: ConfigKey,
        /// Offending value
        value: String,
    },
}

/// Flash tool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FlashConfig {
    /// CAN identifier requests are sent on
    pub request_id: u32,
    /// CAN identifier the ECU responds on
    pub response_id: u32,
    /// Time to wait for each response frame
    pub read_timeout_ms: u64,
    /// Time to wait for a flow control frame
    pub flow_control_timeout_ms: u64,
    /// Read timeout growth factor on 'response pending'
    pub pending_multiplier: u32,
    /// 'Response pending' replies tolerated per request
    pub max_pending_extensions: u32,
    /// Re-sends after 'busy, repeat request'
    pub busy_retries: u32,
    /// Delay before a busy re-send
    pub busy_delay_ms: u64,
    /// Re-sends after a sequence error
    pub sequence_retries: u32,
    /// Tester present period
    pub keep_alive_period_ms: u64,
    /// Attempts per block before the flash aborts
    pub block_retry_budget: u32,
    /// Erase deadline
    pub erase_timeout_ms: u64,
    /// Longest silence tolerated during erase
    pub erase_inactivity_ms: u64,
    /// Seed/key attempts
    pub security_attempts: u32,
    /// Mandatory wait between seed and key. 0 for none
    pub security_delay_ms: u64,
    /// Security level requested from the bootloader
    pub bootloader_level: SecurityLevel,
    /// Bootloader load and start address
    pub bootloader_address: u32,
    /// Bytes per memory read
    pub read_chunk: u8,
    /// Identification record used to detect a running bootloader
    pub probe_did: u8,
    /// Frames buffered by the listener
    pub listener_depth: usize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            request_id: 0x7E0,
            response_id: 0x7E8,
            read_timeout_ms: 1000,
            flow_control_timeout_ms: 1000,
            pending_multiplier: 2,
            max_pending_extensions: 8,
            busy_retries: 5,
            busy_delay_ms: 100,
            sequence_retries: 2,
            keep_alive_period_ms: 2000,
            block_retry_budget: 3,
            erase_timeout_ms: 120_000,
            erase_inactivity_ms: 15_000,
            security_attempts: 3,
            security_delay_ms: 0,
            bootloader_level: SecurityLevel::LevelFB,
            bootloader_address: BOOTLOADER_ADDRESS,
            read_chunk: 0x80,
            probe_did: PROBE_DID,
            listener_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

fn parse_num<T: TryFrom<u64>>(key: ConfigKey, value: &str) -> Result<T, ConfigError> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => v.parse::<u64>().ok(),
    };
    parsed
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

impl FlashConfig {
    /// Builds a configuration from defaults overridden by `pairs`
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut cfg = Self::default();
        for (k, v) in pairs {
            let key = ConfigKey::from_str(k.trim())
                .map_err(|_| ConfigError::UnknownKey(k.to_string()))?;
            cfg.set(key, v)?;
        }
        Ok(cfg)
    }

    /// Sets a single value
    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        match key {
            ConfigKey::RequestId => self.request_id = parse_num(key, value)?,
            ConfigKey::ResponseId => self.response_id = parse_num(key, value)?,
            ConfigKey::ReadTimeoutMs => self.read_timeout_ms = parse_num(key, value)?,
            ConfigKey::FlowControlTimeoutMs => {
                self.flow_control_timeout_ms = parse_num(key, value)?
            }
            ConfigKey::PendingMultiplier => self.pending_multiplier = parse_num(key, value)?,
            ConfigKey::MaxPendingExtensions => self.max_pending_extensions = parse_num(key, value)?,
            ConfigKey::BusyRetries => self.busy_retries = parse_num(key, value)?,
            ConfigKey::BusyDelayMs => self.busy_delay_ms = parse_num(key, value)?,
            ConfigKey::SequenceRetries => self.sequence_retries = parse_num(key, value)?,
            ConfigKey::KeepAlivePeriodMs => self.keep_alive_period_ms = parse_num(key, value)?,
            ConfigKey::BlockRetryBudget => self.block_retry_budget = parse_num(key, value)?,
            ConfigKey::EraseTimeoutMs => self.erase_timeout_ms = parse_num(key, value)?,
            ConfigKey::EraseInactivityMs => self.erase_inactivity_ms = parse_num(key, value)?,
            ConfigKey::SecurityAttempts => self.security_attempts = parse_num(key, value)?,
            ConfigKey::SecurityDelayMs => self.security_delay_ms = parse_num(key, value)?,
            ConfigKey::BootloaderLevel => {
                self.bootloader_level =
                    SecurityLevel::from_str(value.trim()).map_err(|_| ConfigError::InvalidValue {
                        key,
                        value: value.to_string(),
                    })?
            }
            ConfigKey::BootloaderAddress => self.bootloader_address = parse_num(key, value)?,
            ConfigKey::ReadChunk => self.read_chunk = parse_num(key, value)?,
            ConfigKey::ProbeDid => self.probe_did = parse_num(key, value)?,
            ConfigKey::ListenerDepth => self.listener_depth = parse_num(key, value)?,
        }
        Ok(())
    }

    /// Request/response policy
    pub fn response_policy(&self) -> ResponsePolicy {
        ResponsePolicy {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            pending_multiplier: self.pending_multiplier,
            max_pending_extensions: self.max_pending_extensions,
            busy_retries: self.busy_retries,
            busy_delay: Duration::from_millis(self.busy_delay_ms),
            sequence_retries: self.sequence_retries,
        }
    }

    /// Session tunables
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            keep_alive_period: Duration::from_millis(self.keep_alive_period_ms),
            security_attempts: self.security_attempts,
        }
    }

    /// Workflow tunables
    pub fn flash_options(&self) -> FlashOptions {
        FlashOptions {
            block_retry_budget: self.block_retry_budget,
            erase: ErasePolicy {
                timeout: Duration::from_millis(self.erase_timeout_ms),
                inactivity: Duration::from_millis(self.erase_inactivity_ms),
            },
            security_delay: (self.security_delay_ms != 0)
                .then(|| Duration::from_millis(self.security_delay_ms)),
            bootloader_level: self.bootloader_level,
            bootloader_address: self.bootloader_address,
            read_chunk: self.read_chunk,
            probe_did: self.probe_did,
        }
    }

    /// Opens `channel` and builds the session stack on top of it
    pub fn connect(&self, channel: Arc<dyn FrameChannel>) -> DiagResult<SessionManager> {
        let listener = Arc::new(Listener::new(self.listener_depth));
        listener.attach(channel.as_ref())?;
        channel.set_allowed_ids(&[self.response_id])?;
        channel.open()?;
        log::info!(
            "Connected. Tx 0x{:03X}, Rx 0x{:03X}",
            self.request_id,
            self.response_id
        );
        let codec = SegmentedCodec::new(
            channel,
            listener,
            self.request_id,
            self.response_id,
            Duration::from_millis(self.flow_control_timeout_ms),
        );
        let client = KwpClient::new(codec, self.response_policy());
        Ok(SessionManager::new(client, self.session_options()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn pairs_override_defaults() {
        let cfg = FlashConfig::from_pairs([
            ("request_id", "0x7E2"),
            ("read_timeout_ms", "250"),
            ("bootloader_level", "FD"),
            ("security_delay_ms", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.request_id, 0x7E2);
        assert_eq!(cfg.response_id, 0x7E8);
        assert_eq!(cfg.response_policy().read_timeout, Duration::from_millis(250));
        assert_eq!(cfg.bootloader_level, SecurityLevel::LevelFD);
        assert_eq!(cfg.flash_options().security_delay, None);
        assert_eq!(cfg.flash_options().erase.timeout, Duration::from_secs(120));
    }

    #[test]
    fn schema_is_closed() {
        assert!(matches!(
            FlashConfig::from_pairs([("colour", "blue")]),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            FlashConfig::from_pairs([("read_chunk", "0x100")]),
            Err(ConfigError::InvalidValue { key: ConfigKey::ReadChunk, .. })
        ));
        assert!(FlashConfig::from_pairs([("busy_retries", "many")]).is_err());
        for key in ConfigKey::iter() {
            assert_eq!(ConfigKey::from_str(&key.to_string()).unwrap(), key);
        }
    }
}

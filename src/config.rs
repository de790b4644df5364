//! master settings, loadable from a TOML file

use std::path::{Path, PathBuf};
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    hooks::HookPolicy,
    error::{EthercatError, EthercatResult},
    };


/**
    settings of a master instance

    Every field has a default, so a configuration file only needs to mention what differs:

    ```toml
    interface = "eth1"
    cycle_frequency = 1000

    [mailbox]
    retries = 5
    ```
*/
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    /// name of the network interface connected to the segment
    pub interface: String,
    /// directory holding the device description files
    pub esi_directory: PathBuf,
    /// (Hz) frequency of the cyclic process data exchange
    pub cycle_frequency: u32,
    /// (µs) time kept free at the end of each cycle, the frame must come back before the next cycle minus this margin
    pub frame_margin_us: u64,
    /// (ms) time allowed to the slaves to reach a requested state
    pub state_timeout_ms: u64,
    /// run the cyclic thread with realtime priority when the platform allows it
    pub realtime: bool,
    /// what to do when an initialization hook fails
    pub hook_policy: HookPolicy,
    pub mailbox: MailboxConfig,
    pub watchdog: WatchdogConfig,
}

/// settings of the acyclic mailbox channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailboxConfig {
    /// (ms) time allowed to the slave to answer one attempt of a request
    pub timeout_ms: u64,
    /// number of attempts after the first one, before the request is reported failed
    pub retries: u32,
    /// (ms) wait before the first retry, doubled on each following retry
    pub backoff_ms: u64,
    /// (µs) interval between two polls of the mailbox state while waiting for an answer
    pub poll_us: u64,
}

/// settings of the cyclic watchdog and its recovery
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogConfig {
    /// number of consecutive missed exchanges of a mandatory slave before the watchdog fires
    pub misses: u32,
    /// number of attempts to bring the bus back to operational before declaring a fault
    pub recovery_attempts: u32,
    /// (ms) wait before each recovery attempt, multiplied by the attempt number
    pub recovery_backoff_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            interface: String::from("eth0"),
            esi_directory: PathBuf::from("esi"),
            cycle_frequency: 10,
            frame_margin_us: 200,
            state_timeout_ms: 2000,
            realtime: true,
            hook_policy: HookPolicy::Abort,
            mailbox: MailboxConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}
impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            retries: 3,
            backoff_ms: 10,
            poll_us: 500,
        }
    }
}
impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            misses: 3,
            recovery_attempts: 3,
            recovery_backoff_ms: 100,
        }
    }
}

impl MasterConfig {
    /// parse a configuration from TOML text, and validate it
    pub fn from_toml(text: &str) -> EthercatResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| EthercatError::Configuration(format!("invalid configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }
    /// read and parse a configuration file
    pub fn load(path: impl AsRef<Path>) -> EthercatResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }
    /// dump to TOML text
    pub fn to_toml(&self) -> EthercatResult<String> {
        toml::to_string(self)
            .map_err(|err| EthercatError::Configuration(format!("cannot serialize configuration: {}", err)))
    }

    /// check the settings are consistent
    pub fn validate(&self) -> EthercatResult {
        if self.cycle_frequency == 0
            {return Err(EthercatError::Configuration("cycle frequency must be positive".into()))}
        if Duration::from_micros(self.frame_margin_us) >= self.period()
            {return Err(EthercatError::Configuration("frame margin must be shorter than the cycle period".into()))}
        if self.mailbox.timeout_ms == 0
            {return Err(EthercatError::Configuration("mailbox timeout must be positive".into()))}
        if self.mailbox.poll_us == 0
            {return Err(EthercatError::Configuration("mailbox poll interval must be positive".into()))}
        if self.watchdog.misses == 0
            {return Err(EthercatError::Configuration("watchdog must tolerate at least one missed cycle".into()))}
        if self.state_timeout_ms == 0
            {return Err(EthercatError::Configuration("state timeout must be positive".into()))}
        Ok(())
    }

    /// duration of one cycle
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.cycle_frequency.max(1)
    }
    /// maximum time waiting for a cyclic frame
    pub fn frame_timeout(&self) -> Duration {
        self.period().saturating_sub(Duration::from_micros(self.frame_margin_us))
    }
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }
}

impl MailboxConfig {
    pub fn timeout(&self) -> Duration  {Duration::from_millis(self.timeout_ms)}
    pub fn poll(&self) -> Duration  {Duration::from_micros(self.poll_us)}
    /// wait before the given retry, starting at 1
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms)
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

impl WatchdogConfig {
    /// wait before the given recovery attempt, starting at 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms).saturating_mul(attempt)
    }
}

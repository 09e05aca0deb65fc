use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Global knobs that tune a harvest run.
///
/// All fields carry defaults so a deployment only has to override what it
/// cares about (usually the endpoint and the file locations).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Server endpoint, e.g. `opc.tcp://plant-gw:4840`.
    pub endpoint_url: String,
    /// Admission/drain cadence and subscription capacity.
    pub schedule: ScheduleConfig,
    /// Session and subscription parameters handed to the protocol adapter.
    pub session: SessionSettings,
    /// What to do with subscribed tags that never produce a good value.
    pub stuck: StuckTagPolicy,
    /// Where the tag list is read from.
    pub input: InputConfig,
    /// Where result and unresolved rows are appended.
    pub output: OutputConfig,
    /// Host wrapper cadence.
    pub service: ServiceConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "opc.tcp://localhost:4840".to_string(),
            schedule: ScheduleConfig::default(),
            session: SessionSettings::default(),
            stuck: StuckTagPolicy::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_url.trim().is_empty() {
            return Err(HarvestError::Config("endpoint_url must not be empty".into()));
        }
        if self.schedule.max_batch_size == 0 {
            return Err(HarvestError::Config(
                "schedule.max_batch_size must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("schedule.batch_interval_ms", self.schedule.batch_interval_ms),
            ("schedule.publish_interval_ms", self.schedule.publish_interval_ms),
            (
                "schedule.health_check_interval_ms",
                self.schedule.health_check_interval_ms,
            ),
            ("session.operation_timeout_ms", self.session.operation_timeout_ms),
        ] {
            if value == 0 {
                return Err(HarvestError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.stuck.stale_cycles == 0 {
            return Err(HarvestError::Config("stuck.stale_cycles must be at least 1".into()));
        }
        Ok(())
    }
}

/// How the run reacts when the supervisor starts reconnecting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Pause admission and draining, keep the run alive, and continue with the
    /// same registry once the supervisor reports the session is back.
    #[default]
    Resume,
    /// End the run with [`RunOutcome::Reconnecting`](super::RunOutcome) and
    /// let the host start a fresh one.
    EndRun,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Upper bound on tags subscribed at the same time. Servers commonly
    /// throttle or drop sessions that monitor too many items at once.
    pub max_batch_size: usize,
    /// Cadence (ms) of the admission loop.
    pub batch_interval_ms: u64,
    /// Cadence (ms) of the drain loop; also the subscription publishing
    /// interval requested from the server.
    pub publish_interval_ms: u64,
    /// Cadence (ms) of the connection health check.
    pub health_check_interval_ms: u64,
    pub reconnect_policy: ReconnectPolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            batch_interval_ms: 60_000,
            publish_interval_ms: 1_000,
            health_check_interval_ms: 60_000,
            reconnect_policy: ReconnectPolicy::Resume,
        }
    }
}

impl ScheduleConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Parameters for the protocol session and its single subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub session_name: String,
    pub subscription_name: String,
    /// Publishing intervals without data before the server sends a keep-alive.
    pub keep_alive_count: u32,
    /// Publishing intervals without a client request before the server drops
    /// the subscription.
    pub lifetime_count: u32,
    /// Sampling interval requested for each monitored item.
    pub sampling_interval_ms: u64,
    /// Server-side session timeout.
    pub session_timeout_ms: u64,
    /// Client-side bound on any single protocol call.
    pub operation_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_name: "tagharvest-session".to_string(),
            subscription_name: "tagharvest-subscription".to_string(),
            keep_alive_count: 10,
            lifetime_count: 100,
            sampling_interval_ms: 1_000,
            session_timeout_ms: 300_000,
            operation_timeout_ms: 10_000,
        }
    }
}

impl SessionSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Policy for tags that stay subscribed without ever delivering a good value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckTagPolicy {
    /// Consecutive drain cycles without a good value before the tag's
    /// existence is re-verified against the server.
    pub stale_cycles: u32,
    /// Give up on a tag the server keeps confirming as valid after this many
    /// confirmations. `None` keeps waiting until the run ends.
    pub abandon_after_verifications: Option<u32>,
}

impl Default for StuckTagPolicy {
    fn default() -> Self {
        Self {
            stale_cycles: 5,
            abandon_after_verifications: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub tag_list_folder: PathBuf,
    pub tag_list_file: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            tag_list_folder: PathBuf::from("."),
            tag_list_file: "tags.txt".to_string(),
        }
    }
}

impl InputConfig {
    pub fn tag_list_path(&self) -> PathBuf {
        self.tag_list_folder.join(&self.tag_list_file)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub result_folder: PathBuf,
    pub result_prefix: String,
    pub unresolved_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            result_folder: PathBuf::from("results"),
            result_prefix: "TagValues_".to_string(),
            unresolved_prefix: "NotLocatedTags_".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Minutes between the start of two scheduled runs.
    pub run_interval_minutes: u64,
    /// Delay before a fresh run after one ended because of a reconnect.
    pub restart_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            // One week
            run_interval_minutes: 10_080,
            restart_delay_ms: 5_000,
        }
    }
}

impl ServiceConfig {
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_minutes.saturating_mul(60))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HarvestConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = HarvestConfig::default();
        config.schedule.max_batch_size = 0;
        let err = config.validate().expect_err("zero batch must fail");
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: HarvestConfig = serde_json::from_str(
            r#"{ "endpoint_url": "opc.tcp://plant:4840", "schedule": { "max_batch_size": 50 } }"#,
        )
        .expect("parse partial config");
        assert_eq!(config.endpoint_url, "opc.tcp://plant:4840");
        assert_eq!(config.schedule.max_batch_size, 50);
        assert_eq!(config.schedule.batch_interval_ms, 60_000);
        assert_eq!(config.schedule.reconnect_policy, ReconnectPolicy::Resume);
        assert_eq!(config.stuck.abandon_after_verifications, None);
    }

    #[test]
    fn reconnect_policy_uses_snake_case() {
        let schedule: ScheduleConfig =
            serde_json::from_str(r#"{ "reconnect_policy": "end_run" }"#).expect("parse");
        assert_eq!(schedule.reconnect_policy, ReconnectPolicy::EndRun);
    }
}

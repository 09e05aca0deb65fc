//! Checks for values that are legal but probably not what the operator
//! meant. Hard errors live in `HarvestConfig::validate`.

use std::fmt;

use tagharvest_core::harvest::HarvestConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub key: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigWarnings(Vec<ConfigWarning>);

impl ConfigWarnings {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.0.iter()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|warning| warning.key == key)
    }

    fn push(&mut self, key: &'static str, message: impl Into<String>) {
        self.0.push(ConfigWarning {
            key,
            message: message.into(),
        });
    }
}

/// Servers rarely accept this many monitored items on one subscription.
const LARGE_BATCH: usize = 1_000;

pub fn collect_warnings(config: &HarvestConfig) -> ConfigWarnings {
    let mut warnings = ConfigWarnings::default();
    let schedule = &config.schedule;
    let session = &config.session;

    if !config.endpoint_url.contains("://") {
        warnings.push(
            "endpoint_url",
            format!("'{}' has no scheme, expected e.g. opc.tcp://host:4840", config.endpoint_url),
        );
    }
    if schedule.max_batch_size > LARGE_BATCH {
        warnings.push(
            "schedule.max_batch_size",
            format!(
                "{} concurrent items is above what most servers allow per subscription",
                schedule.max_batch_size
            ),
        );
    }
    if schedule.publish_interval_ms > schedule.batch_interval_ms {
        warnings.push(
            "schedule.publish_interval_ms",
            "drain runs less often than admission, so admissions will mostly find no budget",
        );
    }
    if session.operation_timeout_ms >= schedule.health_check_interval_ms {
        warnings.push(
            "session.operation_timeout_ms",
            "a single call may outlast the health check interval",
        );
    }
    if session.lifetime_count < session.keep_alive_count.saturating_mul(3) {
        warnings.push(
            "session.lifetime_count",
            "should be at least three times keep_alive_count or servers may revise it",
        );
    }
    if config.stuck.abandon_after_verifications == Some(0) {
        warnings.push(
            "stuck.abandon_after_verifications",
            "0 abandons tags on their first existence check",
        );
    }
    if config.service.run_interval_minutes == 0 {
        warnings.push(
            "service.run_interval_minutes",
            "0 restarts a run as soon as the previous one finishes",
        );
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_raise_no_warnings() {
        assert!(collect_warnings(&HarvestConfig::default()).is_empty());
    }

    #[test]
    fn slow_drain_is_flagged() {
        let mut config = HarvestConfig::default();
        config.schedule.publish_interval_ms = 120_000;
        let warnings = collect_warnings(&config);
        assert!(warnings.contains_key("schedule.publish_interval_ms"));
    }

    #[test]
    fn missing_scheme_is_flagged() {
        let config = HarvestConfig {
            endpoint_url: "plant-gw:4840".into(),
            ..HarvestConfig::default()
        };
        let warnings = collect_warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings.contains_key("endpoint_url"));
    }
}

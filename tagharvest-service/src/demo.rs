//! `--simulate` mode: an in-memory server seeded with numbered tags.

use std::sync::Arc;

use tagharvest_core::harvest::HarvestConfig;
use tagharvest_core::input::StaticTags;
use tagharvest_core::session::simulated::{SimulatedServer, SimulatedTag};
use tagharvest_core::types::{DataValue, StatusCode, TagId};

/// Every this many tags, one is unknown to the server so the unresolved file
/// gets exercised too.
const UNKNOWN_EVERY: usize = 17;

pub fn demo_server(count: usize) -> (Arc<SimulatedServer>, StaticTags) {
    let server = SimulatedServer::new();
    let mut tags = Vec::with_capacity(count);
    for i in 0..count {
        let tag = TagId::new(format!("ns=2;s=Demo.Sensor{i:05}"));
        let behaviour = if i % UNKNOWN_EVERY == UNKNOWN_EVERY - 1 {
            SimulatedTag::bad(StatusCode::BAD_NODE_ID_UNKNOWN).unknown()
        } else if i % 3 == 0 {
            SimulatedTag::good(DataValue::Text(format!("state,{i}")))
        } else {
            SimulatedTag::good(DataValue::Float(i as f64 * 1.25))
        };
        server.insert_tag(tag.clone(), behaviour);
        tags.push(tag);
    }
    (server, StaticTags::new(tags))
}

/// Shorten production cadences so a demo finishes in seconds.
pub fn quicken(config: &mut HarvestConfig) {
    config.schedule.batch_interval_ms = config.schedule.batch_interval_ms.min(1_000);
    config.schedule.publish_interval_ms = config.schedule.publish_interval_ms.min(200);
    config.schedule.health_check_interval_ms = config.schedule.health_check_interval_ms.min(1_000);
    config.stuck.stale_cycles = config.stuck.stale_cycles.min(3);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_the_requested_number_of_tags() {
        let (server, _tags) = demo_server(40);
        assert!(format!("{server:?}").contains("tags: 40"));
    }

    #[test]
    fn quicken_only_shortens() {
        let mut config = HarvestConfig::default();
        config.schedule.publish_interval_ms = 50;
        quicken(&mut config);
        assert_eq!(config.schedule.batch_interval_ms, 1_000);
        assert_eq!(config.schedule.publish_interval_ms, 50);
    }
}

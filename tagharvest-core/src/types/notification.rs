use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ids::TagId, value::{DataValue, StatusCode}};

/// Latest value the server pushed for one tag, waiting for the next drain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub tag: TagId,
    pub value: DataValue,
    pub status: StatusCode,
    pub source_timestamp: DateTime<Utc>,
}

impl PendingNotification {
    pub fn new(
        tag: TagId,
        value: impl Into<DataValue>,
        status: StatusCode,
        source_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tag,
            value: value.into(),
            status,
            source_timestamp,
        }
    }

    pub fn good(tag: TagId, value: impl Into<DataValue>) -> Self {
        Self::new(tag, value, StatusCode::GOOD, Utc::now())
    }
}

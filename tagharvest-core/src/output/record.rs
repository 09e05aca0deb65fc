//! Row formatting for the result and unresolved files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DataValue, PendingNotification, StatusCode, TagId};

pub const RESULT_HEADER: &str = "TagId,Value,StatusCode,Timestamp";
pub const UNRESOLVED_HEADER: &str = "TagId,Reason,Timestamp";

/// Render a value as one delimited field.
///
/// Non-empty text is always quoted with internal quotes doubled; every other
/// kind is written bare. Null and empty text produce an empty field.
pub fn format_value(value: &DataValue) -> String {
    match value {
        DataValue::Null => String::new(),
        DataValue::Text(text) if text.is_empty() => String::new(),
        DataValue::Text(text) => quote(text),
        DataValue::DateTime(ts) => format_timestamp(ts),
        other => other.to_string(),
    }
}

/// Round-trip UTC timestamp with 100ns ticks, e.g.
/// `2020-07-22T01:23:25.2660000Z`.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        timestamp.format("%Y-%m-%dT%H:%M:%S"),
        timestamp.timestamp_subsec_nanos() % 1_000_000_000 / 100
    )
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Quote only when the text would otherwise break the row.
fn escape_if_needed(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        quote(text)
    } else {
        text.to_string()
    }
}

/// One captured Good value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub tag: TagId,
    pub value: DataValue,
    pub status: StatusCode,
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    pub fn from_notification(notification: &PendingNotification) -> Self {
        Self {
            tag: notification.tag.clone(),
            value: notification.value.clone(),
            status: notification.status,
            timestamp: notification.source_timestamp,
        }
    }

    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{}",
            self.tag,
            format_value(&self.value),
            self.status,
            format_timestamp(&self.timestamp)
        )
    }
}

/// A tag that was given up on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRecord {
    pub tag: TagId,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl UnresolvedRecord {
    pub fn new(tag: TagId, reason: impl Into<String>) -> Self {
        Self {
            tag,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_row(&self) -> String {
        format!(
            "{},{},{}",
            self.tag,
            escape_if_needed(&self.reason),
            format_timestamp(&self.timestamp)
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 7, 22, 1, 23, 25).single().expect("valid date")
            + chrono::Duration::microseconds(266_000)
    }

    #[test]
    fn text_with_comma_is_quoted() {
        assert_eq!(
            format_value(&DataValue::from("This test has ,a comma")),
            "\"This test has ,a comma\""
        );
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(
            format_value(&DataValue::from("say \"hi\"")),
            "\"say \"\"hi\"\"\""
        );
    }

    #[test]
    fn plain_text_is_still_quoted() {
        assert_eq!(format_value(&DataValue::from("OPEN")), "\"OPEN\"");
    }

    #[test]
    fn numbers_and_booleans_are_bare() {
        assert_eq!(format_value(&DataValue::Float(100.54)), "100.54");
        assert_eq!(format_value(&DataValue::Float(100.0)), "100");
        assert_eq!(format_value(&DataValue::Int(-7)), "-7");
        assert_eq!(format_value(&DataValue::Bool(false)), "False");
        assert_eq!(format_value(&DataValue::Bool(true)), "True");
    }

    #[test]
    fn null_and_empty_text_are_empty_fields() {
        assert_eq!(format_value(&DataValue::Null), "");
        assert_eq!(format_value(&DataValue::from("")), "");
    }

    #[test]
    fn result_row_layout() {
        let record = ResultRecord {
            tag: "ns=4;s=0:UI-18-1406A:Y.Parameters.Unit".into(),
            value: DataValue::from("Deg C"),
            status: StatusCode::GOOD,
            timestamp: at(),
        };
        assert_eq!(
            record.to_row(),
            "ns=4;s=0:UI-18-1406A:Y.Parameters.Unit,\"Deg C\",Good,2020-07-22T01:23:25.2660000Z"
        );
    }

    #[test]
    fn null_value_leaves_an_empty_column() {
        let record = ResultRecord {
            tag: "A".into(),
            value: DataValue::Null,
            status: StatusCode::GOOD,
            timestamp: at(),
        };
        assert_eq!(record.to_row(), "A,,Good,2020-07-22T01:23:25.2660000Z");
    }

    #[test]
    fn unresolved_reason_is_escaped_only_when_needed() {
        let mut record = UnresolvedRecord::new("B".into(), "BadNodeIdUnknown");
        record.timestamp = at();
        assert_eq!(record.to_row(), "B,BadNodeIdUnknown,2020-07-22T01:23:25.2660000Z");

        record.reason = "stale, abandoned".into();
        assert_eq!(record.to_row(), "B,\"stale, abandoned\",2020-07-22T01:23:25.2660000Z");
    }

    #[test]
    fn timestamps_carry_seven_fractional_digits() {
        let base = Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).single().expect("valid date");
        assert_eq!(format_timestamp(&base), "2021-01-02T03:04:05.0000000Z");
        assert_eq!(
            format_timestamp(&(base + chrono::Duration::nanoseconds(123_456_789))),
            "2021-01-02T03:04:05.1234567Z"
        );
        assert_eq!(
            format_value(&DataValue::DateTime(base)),
            "2021-01-02T03:04:05.0000000Z"
        );
    }
}

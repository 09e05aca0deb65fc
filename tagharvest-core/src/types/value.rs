use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol status attached to every value the server reports.
///
/// The top two bits carry the severity: `00` good, `01` uncertain, `10` bad.
/// The remaining bits identify the specific condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

const SEVERITY_MASK: u32 = 0xC000_0000;
const SEVERITY_UNCERTAIN: u32 = 0x4000_0000;
const SEVERITY_BAD: u32 = 0x8000_0000;

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const UNCERTAIN: StatusCode = StatusCode(0x4000_0000);
    pub const UNCERTAIN_LAST_USABLE_VALUE: StatusCode = StatusCode(0x4090_0000);
    pub const BAD: StatusCode = StatusCode(0x8000_0000);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SESSION_ID_INVALID: StatusCode = StatusCode(0x8025_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_NO_COMMUNICATION: StatusCode = StatusCode(0x8031_0000);
    pub const BAD_WAITING_FOR_INITIAL_DATA: StatusCode = StatusCode(0x8032_0000);
    pub const BAD_NODE_ID_INVALID: StatusCode = StatusCode(0x8033_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_NOT_CONNECTED: StatusCode = StatusCode(0x808A_0000);
    pub const BAD_OUT_OF_SERVICE: StatusCode = StatusCode(0x808D_0000);

    pub fn is_good(self) -> bool {
        self.0 & SEVERITY_MASK == 0
    }

    pub fn is_uncertain(self) -> bool {
        self.0 & SEVERITY_MASK == SEVERITY_UNCERTAIN
    }

    pub fn is_bad(self) -> bool {
        self.0 & SEVERITY_BAD != 0
    }

    /// True for the two codes a server uses to say the address itself is
    /// wrong, as opposed to the value being temporarily unavailable.
    pub fn is_unresolvable(self) -> bool {
        self.code() == Self::BAD_NODE_ID_UNKNOWN.code()
            || self.code() == Self::BAD_NODE_ID_INVALID.code()
    }

    /// Condition bits without the low-order info flags.
    pub fn code(self) -> u32 {
        self.0 & 0xFFFF_0000
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.code() {
            0x0000_0000 => "Good",
            0x4000_0000 => "Uncertain",
            0x4090_0000 => "UncertainLastUsableValue",
            0x8000_0000 => "Bad",
            0x8001_0000 => "BadUnexpectedError",
            0x8002_0000 => "BadInternalError",
            0x8005_0000 => "BadCommunicationError",
            0x800A_0000 => "BadTimeout",
            0x8025_0000 => "BadSessionIdInvalid",
            0x8026_0000 => "BadSessionClosed",
            0x8031_0000 => "BadNoCommunication",
            0x8032_0000 => "BadWaitingForInitialData",
            0x8033_0000 => "BadNodeIdInvalid",
            0x8034_0000 => "BadNodeIdUnknown",
            0x808A_0000 => "BadNotConnected",
            0x808D_0000 => "BadOutOfService",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) if self.0 & 0x0000_FFFF == 0 => f.write_str(name),
            _ => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// Value payload carried by a data-change notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => Ok(()),
            DataValue::Bool(true) => f.write_str("True"),
            DataValue::Bool(false) => f.write_str("False"),
            DataValue::Int(v) => write!(f, "{v}"),
            DataValue::UInt(v) => write!(f, "{v}"),
            DataValue::Float(v) => write!(f, "{v}"),
            DataValue::Text(v) => f.write_str(v),
            DataValue::DateTime(v) => write!(
                f,
                "{}.{:07}Z",
                v.format("%Y-%m-%dT%H:%M:%S"),
                v.timestamp_subsec_nanos() % 1_000_000_000 / 100
            ),
        }
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Bool(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int(value)
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Float(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Text(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::Text(value)
    }
}

impl<T: Into<DataValue>> From<Option<T>> for DataValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DataValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bits_classify_codes() {
        assert!(StatusCode::GOOD.is_good());
        assert!(!StatusCode::GOOD.is_bad());
        assert!(StatusCode::UNCERTAIN_LAST_USABLE_VALUE.is_uncertain());
        assert!(!StatusCode::UNCERTAIN_LAST_USABLE_VALUE.is_good());
        assert!(StatusCode::BAD_TIMEOUT.is_bad());
        assert!(StatusCode::BAD_NODE_ID_UNKNOWN.is_unresolvable());
        assert!(StatusCode::BAD_NODE_ID_INVALID.is_unresolvable());
        assert!(!StatusCode::BAD_WAITING_FOR_INITIAL_DATA.is_unresolvable());
    }

    #[test]
    fn status_code_renders_symbolic_name_or_hex() {
        assert_eq!(StatusCode::GOOD.to_string(), "Good");
        assert_eq!(StatusCode::BAD_NODE_ID_UNKNOWN.to_string(), "BadNodeIdUnknown");
        assert_eq!(StatusCode(0x8123_0000).to_string(), "0x81230000");
        assert_eq!(StatusCode(0x0000_0400).to_string(), "0x00000400");
    }

    #[test]
    fn values_render_like_the_result_file_expects() {
        assert_eq!(DataValue::Float(100.0).to_string(), "100");
        assert_eq!(DataValue::Float(100.54).to_string(), "100.54");
        assert_eq!(DataValue::Bool(false).to_string(), "False");
        assert_eq!(DataValue::Null.to_string(), "");
        assert_eq!(DataValue::from(None::<i64>), DataValue::Null);
    }
}

//! Checkpoint encoding

use serde::{Deserialize, Serialize};

use super::BatchPositionValueV1;
use crate::error::{Error, Result};

/// Version tag written by [`JsonPositionCodec`]
pub const POSITION_VERSION_V1: &str = "v1";

/// Converts a checkpoint value to and from the repo payload
pub trait PositionCodec: Send + Sync {
    /// Encode a value
    fn encode(&self, value: &BatchPositionValueV1) -> Result<String>;

    /// Decode a payload
    fn decode(&self, payload: &str) -> Result<BatchPositionValueV1>;
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: String,
    value: T,
}

/// JSON codec with a versioned envelope: `{"version": "v1", "value": {...}}`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPositionCodec;

impl PositionCodec for JsonPositionCodec {
    fn encode(&self, value: &BatchPositionValueV1) -> Result<String> {
        let envelope = Envelope {
            version: POSITION_VERSION_V1.to_string(),
            value,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    fn decode(&self, payload: &str) -> Result<BatchPositionValueV1> {
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(payload)?;
        if envelope.version != POSITION_VERSION_V1 {
            return Err(Error::position(format!(
                "unsupported position version '{}'",
                envelope.version
            )));
        }
        Ok(serde_json::from_value(envelope.value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bound;
    use crate::key_selector::ScanColumnSet;
    use crate::position::TableScanState;
    use crate::types::{ColumnValue, TableIdentity};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_encode_writes_envelope() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut value = BatchPositionValueV1::new(start);
        let mut state = TableScanState::new(
            TableIdentity::new("shop", "orders"),
            ScanColumnSet::keyed(["id"]).unwrap(),
            Bound::from_pairs([("id", ColumnValue::Integer(100))]),
            Bound::from_pairs([("id", ColumnValue::Integer(1))]),
        );
        state.current = Some(Bound::from_pairs([("id", ColumnValue::Integer(40))]));
        state.rows_scanned = 40;
        value.table_states.insert("shop.orders".into(), state);

        let payload = JsonPositionCodec.encode(&value).unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["version"], "v1");
        assert_eq!(
            json["value"]["table_states"]["shop.orders"]["rows_scanned"],
            40
        );

        assert_eq!(JsonPositionCodec.decode(&payload).unwrap(), value);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let payload = r#"{"version":"v9","value":{"start":"2024-05-01T12:00:00Z"}}"#;
        let err = JsonPositionCodec.decode(payload).unwrap_err();
        assert!(err.to_string().contains("v9"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JsonPositionCodec.decode("not json").is_err());
        assert!(JsonPositionCodec
            .decode(r#"{"version":"v1","value":{"start":42}}"#)
            .is_err());
    }
}

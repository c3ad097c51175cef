use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

const TRACE_ID_FIELDS: [&str; 3] = ["traceId", "traceID", "runMeID"];
const REQUEST_FIELDS: [&str; 2] = ["request", "req"];

/// One decoded log line. Every accessor checks the type of the field it reads
/// and reports absence instead of failing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRecord {
    fields: Map<String, Value>,
}

impl LogRecord {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        let fields = serde_json::from_str::<Map<String, Value>>(line)?;
        Ok(Self { fields })
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_object(&self, field: &str) -> Option<&Map<String, Value>> {
        self.get(field).and_then(Value::as_object)
    }

    /// Deserializes `field` into `T`; `None` when the field is absent.
    pub fn decode<T: DeserializeOwned>(&self, field: &str) -> Option<serde_json::Result<T>> {
        self.get(field)
            .map(|value| serde_json::from_value(value.clone()))
    }

    pub fn trace_id(&self) -> Option<&str> {
        TRACE_ID_FIELDS
            .iter()
            .find_map(|field| self.get_str(field))
            .filter(|id| !id.is_empty())
    }

    /// Timestamp logged as fractional seconds since the epoch.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        let seconds = self.get_f64("time")?;
        if !seconds.is_finite() {
            return None;
        }
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::<Utc>::from_timestamp(whole as i64, nanos)
    }

    /// Calling site recorded by the logger.
    pub fn function(&self) -> Option<&str> {
        self.get_str("function")
    }

    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    pub fn request(&self) -> Option<&Value> {
        REQUEST_FIELDS
            .iter()
            .find_map(|field| self.get(field).filter(|value| value.is_object()))
    }

    pub fn response(&self) -> Option<&Value> {
        self.get("response").filter(|value| value.is_object())
    }

    pub fn eval_mode(&self) -> Option<bool> {
        self.get_bool("evalMode")
    }

    pub fn context_id(&self) -> Option<&str> {
        self.get_str("contextId").filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> LogRecord {
        LogRecord::from_value(value).expect("object")
    }

    #[test]
    fn trace_id_checks_known_fields_in_order() {
        assert_eq!(
            record(json!({"traceID": "t1", "runMeID": "r1"})).trace_id(),
            Some("t1")
        );
        assert_eq!(record(json!({"runMeID": "r1"})).trace_id(), Some("r1"));
        assert_eq!(record(json!({"traceId": 7})).trace_id(), None);
        assert_eq!(record(json!({"traceId": ""})).trace_id(), None);
    }

    #[test]
    fn time_parses_fractional_seconds() {
        let time = record(json!({"time": 1_700_000_000.25}))
            .time()
            .expect("time");
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert_eq!(time.timestamp_subsec_millis(), 250);
        assert!(record(json!({"time": "yesterday"})).time().is_none());
    }

    #[test]
    fn request_accepts_both_field_names_but_only_objects() {
        assert!(record(json!({"req": {"a": 1}})).request().is_some());
        assert!(record(json!({"request": "text"})).request().is_none());
        assert!(record(json!({"response": null})).response().is_none());
    }

    #[test]
    fn eval_mode_reports_presence() {
        assert_eq!(record(json!({"evalMode": false})).eval_mode(), Some(false));
        assert_eq!(record(json!({"evalMode": "yes"})).eval_mode(), None);
        assert_eq!(record(json!({})).eval_mode(), None);
    }

    #[test]
    fn non_object_lines_are_rejected() {
        assert!(LogRecord::parse("[1, 2]").is_err());
        assert!(LogRecord::parse("{\"message\": \"ok\"}").is_ok());
    }
}

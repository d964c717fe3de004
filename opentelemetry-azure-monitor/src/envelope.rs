//! Wire representation of a single telemetry item.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One serialized telemetry record ready for transmission to the ingestion
/// service.
///
/// The delivery pipeline treats envelopes as opaque: it stores, batches and
/// re-sends them without looking at the payload. Building envelopes out of spans
/// and metrics happens before they are handed to the exporter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope schema version.
    pub ver: i32,
    /// Telemetry item name, e.g. `Microsoft.ApplicationInsights.Request`.
    pub name: String,
    /// ISO 8601 timestamp of the item.
    pub time: String,
    /// Sampling rate applied to the item, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    /// Sequence field used to track absolute order of uploaded events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<String>,
    /// Instrumentation key of the target resource.
    #[serde(default, rename = "iKey", skip_serializing_if = "Option::is_none")]
    pub instrumentation_key: Option<String>,
    /// Item flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<i64>,
    /// Context tags such as `ai.cloud.role`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Typed payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
}

/// Payload of an [`Envelope`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    /// Name of the payload type, e.g. `RequestData`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,
    /// The payload itself.
    #[serde(default)]
    pub base_data: serde_json::Value,
}

impl Envelope {
    /// Create an envelope with the given name and timestamp.
    pub fn new(name: impl Into<String>, time: impl Into<String>) -> Self {
        Envelope {
            ver: 1,
            name: name.into(),
            time: time.into(),
            ..Default::default()
        }
    }

    /// Attach a typed payload.
    pub fn with_data(mut self, base_type: impl Into<String>, base_data: serde_json::Value) -> Self {
        self.data = Some(Data {
            base_type: Some(base_type.into()),
            base_data,
        });
        self
    }

    /// Set the instrumentation key.
    pub fn with_instrumentation_key(mut self, key: impl Into<String>) -> Self {
        self.instrumentation_key = Some(key.into());
        self
    }

    /// Add a context tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_wire_names() {
        let envelope = Envelope::new("Microsoft.ApplicationInsights.Request", "2020-01-01T00:00:00Z")
            .with_instrumentation_key("1234")
            .with_tag("ai.cloud.role", "checkout")
            .with_data("RequestData", json!({"ver": 2, "name": "GET /"}));

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "ver": 1,
                "name": "Microsoft.ApplicationInsights.Request",
                "time": "2020-01-01T00:00:00Z",
                "iKey": "1234",
                "tags": {"ai.cloud.role": "checkout"},
                "data": {"baseType": "RequestData", "baseData": {"ver": 2, "name": "GET /"}}
            })
        );
    }

    #[test]
    fn deserializes_sparse_envelope() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"ver":1,"name":"n","time":"t","sampleRate":50.0}"#).unwrap();
        assert_eq!(envelope.sample_rate, Some(50.0));
        assert!(envelope.data.is_none());
        assert!(envelope.tags.is_empty());
    }
}

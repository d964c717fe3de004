//! Live Metrics (QuickPulse) wire types.
use crate::Envelope;
use chrono::Utc;
use serde::Serialize;
use std::sync::OnceLock;

/// Version 1 of the QuickPulse protocol.
const INVARIANT_VERSION: u32 = 1;

/// Identifies this process for the lifetime of the stream.
fn stream_id() -> &'static str {
    static STREAM_ID: OnceLock<String> = OnceLock::new();
    STREAM_ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

fn machine_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn sdk_version() -> String {
    format!("rust:ext{}", env!("CARGO_PKG_VERSION"))
}

/// A single metric value in a live metrics sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveMetric {
    /// Performance counter style name, e.g. `\ApplicationInsights\Requests/Sec`.
    pub name: String,
    /// Sampled value.
    pub value: f64,
    /// Aggregation weight.
    pub weight: u32,
}

impl LiveMetric {
    /// Metric with a weight of one.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        LiveMetric {
            name: name.into(),
            value,
            weight: 1,
        }
    }
}

/// Key/value property attached to a [`LiveMetricDocument`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LiveMetricDocumentProperty {
    /// Property name.
    pub key: String,
    /// Property value rendered as a string.
    pub value: String,
}

/// A telemetry item shown in the live stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveMetricDocument {
    /// QuickPulse document class, e.g. `RequestTelemetryDocument`.
    #[serde(rename = "__type")]
    pub type_name: String,
    /// Short document type, e.g. `Request`.
    pub document_type: String,
    /// Document schema version.
    pub version: String,
    /// Flattened measurements and properties of the item.
    pub properties: Vec<LiveMetricDocumentProperty>,
}

impl LiveMetricDocument {
    /// Build a document from an ingestion envelope.
    ///
    /// Returns `None` for envelopes whose payload type is missing or unknown.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let data = envelope.data.as_ref()?;
        let (type_name, document_type) = match data.base_type.as_deref()? {
            "EventData" => ("EventTelemetryDocument", "Event"),
            "ExceptionData" => ("ExceptionTelemetryDocument", "Exception"),
            "MessageData" => ("TraceTelemetryDocument", "Trace"),
            "MetricData" => ("MetricTelemetryDocument", "Metric"),
            "RequestData" => ("RequestTelemetryDocument", "Request"),
            "RemoteDependencyData" => ("DependencyTelemetryDocument", "RemoteDependency"),
            "AvailabilityData" => ("AvailabilityTelemetryDocument", "Availability"),
            _ => return None,
        };

        let mut properties = Vec::new();
        for field in ["measurements", "properties"] {
            if let Some(map) = data.base_data.get(field).and_then(|v| v.as_object()) {
                properties.extend(map.iter().map(|(key, value)| LiveMetricDocumentProperty {
                    key: key.clone(),
                    value: match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                }));
            }
        }

        Some(LiveMetricDocument {
            type_name: type_name.to_string(),
            document_type: document_type.to_string(),
            version: "1.0".to_string(),
            properties,
        })
    }
}

/// Payload of a ping or post request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveMetricEnvelope {
    /// Documents to display, `None` on pings.
    pub documents: Option<Vec<LiveMetricDocument>>,
    /// Role instance name.
    pub instance: String,
    /// Instrumentation key of the target resource.
    pub instrumentation_key: String,
    /// Protocol version.
    pub invariant_version: u32,
    /// Host name.
    pub machine_name: String,
    /// Metric samples, `None` on pings.
    pub metrics: Option<Vec<LiveMetric>>,
    /// Identifier of this process' stream.
    pub stream_id: String,
    /// Sample time in `/Date(<unix ms>)/` form.
    pub timestamp: String,
    /// SDK version string.
    pub version: String,
}

impl LiveMetricEnvelope {
    /// Envelope stamped with the current time and process identity.
    pub fn new(instrumentation_key: &str) -> Self {
        let machine = machine_name();
        LiveMetricEnvelope {
            documents: None,
            instance: machine.clone(),
            instrumentation_key: instrumentation_key.to_string(),
            invariant_version: INVARIANT_VERSION,
            machine_name: machine,
            metrics: None,
            stream_id: stream_id().to_string(),
            timestamp: format!("/Date({})/", Utc::now().timestamp_millis()),
            version: sdk_version(),
        }
    }
}

//! Resolution of the instrumentation key, ingestion endpoint and timeout from
//! builder settings and the environment.
use crate::error::ExporterBuildError;
use opentelemetry::otel_warn;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Connection string of the target Application Insights resource, e.g.
/// `InstrumentationKey=...;IngestionEndpoint=https://...`.
pub const ENV_CONNECTION_STRING: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";

/// Instrumentation key of the target resource.
pub const ENV_INSTRUMENTATION_KEY: &str = "APPINSIGHTS_INSTRUMENTATIONKEY";

/// Maximum time in milliseconds the exporter waits for each request.
pub const ENV_TIMEOUT: &str = "OTEL_EXPORTER_AZURE_MONITOR_TIMEOUT";

/// Default ingestion service, without the track path.
pub const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

const TRACK_PATH: &str = "/v2/track";

/// The parts of a connection string the exporter uses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ConnectionString {
    pub(crate) instrumentation_key: Option<String>,
    pub(crate) ingestion_endpoint: Option<String>,
}

impl ConnectionString {
    /// Parse `Key=Value` pairs separated by `;`. Keys are case-insensitive.
    ///
    /// Without an explicit `IngestionEndpoint`, the endpoint is derived from
    /// `EndpointSuffix` and the optional `Location`.
    pub(crate) fn parse(value: &str) -> Result<Self, ExporterBuildError> {
        let mut pairs = HashMap::new();
        for pair in value.split(';').filter(|pair| !pair.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ExporterBuildError::InvalidConnectionString(pair.to_string()))?;
            pairs.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        if let Some(auth) = pairs.get("authorization") {
            if !auth.eq_ignore_ascii_case("ikey") {
                return Err(ExporterBuildError::InvalidConnectionString(format!(
                    "unsupported authorization {}",
                    auth
                )));
            }
        }

        let ingestion_endpoint = match pairs.remove("ingestionendpoint") {
            Some(endpoint) => Some(endpoint),
            None => pairs.get("endpointsuffix").map(|suffix| {
                match pairs.get("location") {
                    Some(location) => format!("https://{}.dc.{}", location, suffix),
                    None => format!("https://dc.{}", suffix),
                }
            }),
        };

        Ok(ConnectionString {
            instrumentation_key: pairs.remove("instrumentationkey"),
            ingestion_endpoint: ingestion_endpoint.filter(|e| !e.is_empty()),
        })
    }
}

/// Settings needed to talk to the ingestion service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedConfig {
    pub(crate) instrumentation_key: String,
    /// Full track URL.
    pub(crate) endpoint: String,
}

/// Combine builder values with the environment.
///
/// The key is taken from, in order: the explicit connection string, the
/// explicit key, the connection string in the environment, the key in the
/// environment. The endpoint from: the explicit connection string, the
/// connection string in the environment, the explicit endpoint, the default.
pub(crate) fn resolve(
    connection_string: Option<&str>,
    instrumentation_key: Option<&str>,
    endpoint: Option<&str>,
) -> Result<ResolvedConfig, ExporterBuildError> {
    let code = connection_string
        .map(ConnectionString::parse)
        .transpose()?
        .unwrap_or_default();
    let from_env = env_var(ENV_CONNECTION_STRING)
        .map(|value| ConnectionString::parse(&value))
        .transpose()?
        .unwrap_or_default();

    let key = code
        .instrumentation_key
        .or_else(|| instrumentation_key.map(str::to_string))
        .or(from_env.instrumentation_key)
        .or_else(|| env_var(ENV_INSTRUMENTATION_KEY))
        .filter(|key| !key.is_empty())
        .ok_or(ExporterBuildError::MissingInstrumentationKey)?;
    validate_instrumentation_key(&key)?;

    let base = code
        .ingestion_endpoint
        .or(from_env.ingestion_endpoint)
        .or_else(|| endpoint.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_string());

    Ok(ResolvedConfig {
        instrumentation_key: key,
        endpoint: format!("{}{}", base.trim_end_matches('/'), TRACK_PATH),
    })
}

/// An instrumentation key is a lowercase, hyphenated RFC 4122 UUID of
/// version 1 to 5.
pub(crate) fn validate_instrumentation_key(key: &str) -> Result<(), ExporterBuildError> {
    let invalid = || ExporterBuildError::InvalidInstrumentationKey(key.to_string());
    if key.len() != 36 || key.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(invalid());
    }
    let uuid = uuid::Uuid::try_parse(key).map_err(|_| invalid())?;
    if !(1..=5).contains(&uuid.get_version_num()) || uuid.get_variant() != uuid::Variant::RFC4122
    {
        return Err(invalid());
    }
    Ok(())
}

/// Request timeout from [`ENV_TIMEOUT`], or the default.
pub(crate) fn timeout_from_env() -> Duration {
    match env_var(ENV_TIMEOUT) {
        Some(timeout) => match timeout.parse() {
            Ok(timeout) => Duration::from_millis(timeout),
            Err(err) => {
                otel_warn!(
                    name: "AzureMonitorExporter.TimeoutMalformed",
                    value = timeout.clone(),
                    error = format!("{}", err)
                );
                DEFAULT_TIMEOUT
            }
        },
        None => DEFAULT_TIMEOUT,
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|var| !var.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "1234abcd-5678-4efa-8abc-1234567890ab";
    const OTHER_KEY: &str = "4321abcd-5678-4efa-8abc-1234567890ab";

    fn without_env<F: FnOnce()>(f: F) {
        temp_env::with_vars_unset(
            [ENV_CONNECTION_STRING, ENV_INSTRUMENTATION_KEY, ENV_TIMEOUT],
            f,
        )
    }

    #[test]
    fn parse_connection_string_case_insensitive() {
        let parsed = ConnectionString::parse(&format!(
            "Authorization=ikey;InstrumentationKey={};ingestionendpoint=https://ingest.example.com",
            KEY
        ))
        .unwrap();
        assert_eq!(parsed.instrumentation_key.as_deref(), Some(KEY));
        assert_eq!(
            parsed.ingestion_endpoint.as_deref(),
            Some("https://ingest.example.com")
        );
    }

    #[test]
    fn parse_connection_string_builds_endpoint_from_suffix() {
        let parsed =
            ConnectionString::parse("InstrumentationKey=k;EndpointSuffix=example.com;Location=westus")
                .unwrap();
        assert_eq!(
            parsed.ingestion_endpoint.as_deref(),
            Some("https://westus.dc.example.com")
        );

        let parsed = ConnectionString::parse("InstrumentationKey=k;EndpointSuffix=example.com;").unwrap();
        assert_eq!(parsed.ingestion_endpoint.as_deref(), Some("https://dc.example.com"));

        let parsed = ConnectionString::parse("InstrumentationKey=k").unwrap();
        assert_eq!(parsed.ingestion_endpoint, None);
    }

    #[test]
    fn parse_connection_string_rejects_bad_input() {
        assert!(matches!(
            ConnectionString::parse("Authorization=aad;InstrumentationKey=k"),
            Err(ExporterBuildError::InvalidConnectionString(_))
        ));
        assert!(matches!(
            ConnectionString::parse("InstrumentationKey"),
            Err(ExporterBuildError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn instrumentation_key_validation() {
        assert!(validate_instrumentation_key(KEY).is_ok());
        for key in [
            "",
            "not-a-uuid",
            "1234ABCD-5678-4efa-8abc-1234567890ab",
            // version 0
            "1234abcd-5678-0efa-8abc-1234567890ab",
            // version 6
            "1234abcd-5678-6efa-8abc-1234567890ab",
            // non RFC 4122 variant
            "1234abcd-5678-4efa-cabc-1234567890ab",
            "1234abcd56784efa8abc1234567890ab",
        ] {
            assert!(validate_instrumentation_key(key).is_err(), "{}", key);
        }
    }

    #[test]
    fn explicit_values_win_over_environment() {
        temp_env::with_vars(
            [
                (
                    ENV_CONNECTION_STRING,
                    Some(format!(
                        "InstrumentationKey={};IngestionEndpoint=https://env.example.com",
                        OTHER_KEY
                    )),
                ),
                (ENV_INSTRUMENTATION_KEY, Some(OTHER_KEY.to_string())),
            ],
            || {
                let resolved = resolve(
                    Some(&format!(
                        "InstrumentationKey={};IngestionEndpoint=https://code.example.com/",
                        KEY
                    )),
                    None,
                    None,
                )
                .unwrap();
                assert_eq!(resolved.instrumentation_key, KEY);
                assert_eq!(resolved.endpoint, "https://code.example.com/v2/track");

                // explicit key beats the environment, the endpoint still comes from it
                let resolved = resolve(None, Some(KEY), Some("https://explicit.example.com")).unwrap();
                assert_eq!(resolved.instrumentation_key, KEY);
                assert_eq!(resolved.endpoint, "https://env.example.com/v2/track");
            },
        );
    }

    #[test]
    fn environment_fallbacks() {
        without_env(|| {
            assert!(matches!(
                resolve(None, None, None),
                Err(ExporterBuildError::MissingInstrumentationKey)
            ));
        });

        temp_env::with_vars(
            [
                (ENV_CONNECTION_STRING, None),
                (ENV_INSTRUMENTATION_KEY, Some(KEY)),
            ],
            || {
                let resolved = resolve(None, None, None).unwrap();
                assert_eq!(resolved.instrumentation_key, KEY);
                assert_eq!(resolved.endpoint, "https://dc.services.visualstudio.com/v2/track");

                let resolved = resolve(None, None, Some("https://explicit.example.com")).unwrap();
                assert_eq!(resolved.endpoint, "https://explicit.example.com/v2/track");
            },
        );
    }

    #[test]
    fn invalid_key_is_rejected() {
        without_env(|| {
            assert!(matches!(
                resolve(None, Some("foo"), None),
                Err(ExporterBuildError::InvalidInstrumentationKey(_))
            ));
        });
    }

    #[test]
    fn timeout_from_environment() {
        without_env(|| assert_eq!(timeout_from_env(), DEFAULT_TIMEOUT));
        temp_env::with_var(ENV_TIMEOUT, Some("a"), || {
            assert_eq!(timeout_from_env(), DEFAULT_TIMEOUT)
        });
        temp_env::with_var(ENV_TIMEOUT, Some("777"), || {
            assert_eq!(timeout_from_env(), Duration::from_millis(777))
        });
    }
}

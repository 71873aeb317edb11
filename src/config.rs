use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{ListenerError, Result};

/// Handler setting that holds the connection reference.
pub const CONNECTION_KEY: &str = "execConnection";
/// Name of the connection setting carrying the server id.
pub const CONNECTION_NAME: &str = "name";
/// How long `stop` waits for a broker run loop unless configured otherwise.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Adapter level settings, read once when the listener is created.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(deserialize_with = "duration_opt")]
    pub invocation_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration")]
    pub shutdown_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            invocation_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl Settings {
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn duration_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Configuration handed to the listener factory by the host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub id: String,
    pub settings: Map<String, Value>,
}

/// Per handler settings. Loosely typed, the host stores whatever the flow declares.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct HandlerSettings(pub Map<String, Value>);

impl HandlerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings pointing at a single server id.
    pub fn for_server(server_id: impl Into<String>) -> Self {
        let connection = serde_json::json!({
            "settings": [{ "name": CONNECTION_NAME, "value": server_id.into() }]
        });
        Self::new().with(CONNECTION_KEY, connection)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Map<String, Value>> for HandlerSettings {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Resolves the server id out of the connection reference in `settings`.
///
/// Returns `Ok(None)` when the connection carries no `settings` array. Among
/// several `name` entries the last one wins.
pub fn resolve_server_id(settings: &HandlerSettings) -> Result<Option<String>> {
    let connection = settings
        .get(CONNECTION_KEY)
        .ok_or(ListenerError::ConfigMissing(CONNECTION_KEY))?;

    let connection = coerce_to_object(connection).ok_or_else(|| {
        ListenerError::ConfigInvalid(format!("expected an object, found {}", kind(connection)))
    })?;

    let Some(entries) = connection.get("settings").and_then(Value::as_array) else {
        return Ok(None);
    };

    let mut server_id = None;
    for entry in entries {
        let Some(entry) = coerce_to_object(entry) else {
            continue;
        };
        if entry.get("name").and_then(Value::as_str) != Some(CONNECTION_NAME) {
            continue;
        }
        match entry.get("value") {
            Some(Value::String(value)) => server_id = Some(value.clone()),
            other => {
                return Err(ListenerError::ConnectionValueType {
                    found: other.map_or("nothing", kind),
                })
            }
        }
    }

    server_id.map(Some).ok_or_else(|| {
        ListenerError::ConfigInvalid(format!("no `{CONNECTION_NAME}` entry in connection settings"))
    })
}

// objects pass through, strings are parsed as JSON objects
fn coerce_to_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_connection(connection: Value) -> HandlerSettings {
        HandlerSettings::new().with(CONNECTION_KEY, connection)
    }

    #[test]
    fn resolves_single_name() {
        let settings = HandlerSettings::for_server("srv-1");
        assert_eq!(resolve_server_id(&settings).unwrap(), Some("srv-1".to_string()));
    }

    #[test]
    fn last_name_wins() {
        let settings = with_connection(json!({
            "settings": [
                { "name": "name", "value": "first" },
                { "name": "host", "value": "localhost" },
                { "name": "name", "value": "second" },
            ]
        }));
        assert_eq!(resolve_server_id(&settings).unwrap(), Some("second".to_string()));
    }

    #[test]
    fn skips_entries_that_are_not_objects() {
        let settings = with_connection(json!({
            "settings": [42, "junk", null, { "name": "name", "value": "srv-2" }]
        }));
        assert_eq!(resolve_server_id(&settings).unwrap(), Some("srv-2".to_string()));
    }

    #[test]
    fn accepts_connection_as_json_string() {
        let raw = r#"{"settings":[{"name":"name","value":"srv-3"}]}"#;
        let settings = with_connection(Value::String(raw.into()));
        assert_eq!(resolve_server_id(&settings).unwrap(), Some("srv-3".to_string()));
    }

    #[test]
    fn missing_connection() {
        let err = resolve_server_id(&HandlerSettings::new()).unwrap_err();
        assert!(matches!(err, ListenerError::ConfigMissing(CONNECTION_KEY)));
    }

    #[test]
    fn connection_not_an_object() {
        for bad in [json!(7), json!(null), json!([1, 2]), json!("not json")] {
            let err = resolve_server_id(&with_connection(bad)).unwrap_err();
            assert!(matches!(err, ListenerError::ConfigInvalid(_)), "{err}");
        }
    }

    #[test]
    fn name_value_must_be_a_string() {
        let settings = with_connection(json!({ "settings": [{ "name": "name", "value": 12 }] }));
        let err = resolve_server_id(&settings).unwrap_err();
        assert!(matches!(err, ListenerError::ConnectionValueType { found: "a number" }));
    }

    #[test]
    fn no_settings_array_resolves_nothing() {
        assert_eq!(resolve_server_id(&with_connection(json!({}))).unwrap(), None);
        let settings = with_connection(json!({ "settings": "oops" }));
        assert_eq!(resolve_server_id(&settings).unwrap(), None);
    }

    #[test]
    fn settings_without_name_entry() {
        for entries in [json!([{ "name": "host", "value": "x" }]), json!([])] {
            let settings = with_connection(json!({ "settings": entries }));
            assert!(matches!(
                resolve_server_id(&settings).unwrap_err(),
                ListenerError::ConfigInvalid(_)
            ));
        }
    }

    #[test]
    fn settings_parse_durations() {
        let map = json!({ "invocationTimeout": "250ms", "unrelated": true });
        let Value::Object(map) = map else { unreachable!() };
        let settings = Settings::from_map(map).unwrap();
        assert_eq!(settings.invocation_timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn settings_reject_bad_duration() {
        let Value::Object(map) = json!({ "shutdownTimeout": "soon" }) else { unreachable!() };
        assert!(matches!(Settings::from_map(map), Err(ListenerError::Settings(_))));
    }

    #[test]
    fn shutdown_timeout_is_always_bounded() {
        assert_eq!(Settings::default().shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        let Value::Object(map) = json!({ "shutdownTimeout": "2m" }) else { unreachable!() };
        let settings = Settings::from_map(map).unwrap();
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(120));
    }
}

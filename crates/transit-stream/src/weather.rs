use serde::Deserialize;

use crate::handler::{ConsumedRecord, MessageHandler};

pub const WEATHER_TOPIC: &str = "org.chicago.cta.weather.v1";

/// Avro key schema of the weather topic.
pub const WEATHER_KEY_SCHEMA: &str = r#"{
    "namespace": "com.udacity",
    "type": "record",
    "name": "weather.key",
    "fields": [
        {"name": "timestamp", "type": "long"}
    ]
}"#;

/// Avro value schema of the weather topic.
pub const WEATHER_VALUE_SCHEMA: &str = r#"{
    "namespace": "com.udacity",
    "type": "record",
    "name": "weather.value",
    "fields": [
        {"name": "temperature", "type": "double"},
        {"name": "status", "type": "string"}
    ]
}"#;

#[derive(Deserialize)]
struct WeatherUpdate {
    temperature: Option<f64>,
    status: Option<String>,
}

/// Latest observed weather.
#[derive(Debug, Clone, PartialEq)]
pub struct Weather {
    pub temperature: f64,
    pub status: String,
    topic: String,
}

impl Default for Weather {
    fn default() -> Self { Self::new(WEATHER_TOPIC) }
}

impl Weather {
    /// Weather model fed from `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            temperature: 70.0,
            status: "sunny".to_string(),
            topic: topic.into(),
        }
    }

    /// Apply a weather record. Records from other topics are ignored, and fields the
    /// record leaves out keep their previous value.
    pub fn process_message(&mut self, record: &ConsumedRecord) {
        if record.topic != self.topic {
            return;
        }

        let Some(ref value) = record.value else {
            tracing::debug!(offset = record.offset, "Weather record without value");
            return;
        };

        match value.deserialize::<WeatherUpdate>() {
            Ok(update) => {
                if let Some(temperature) = update.temperature {
                    self.temperature = temperature;
                }
                if let Some(status) = update.status {
                    self.status = status;
                }
                tracing::debug!(
                    temperature = self.temperature,
                    status = %self.status,
                    "Weather updated"
                );
            },
            Err(e) => tracing::warn!(?e, offset = record.offset, "Malformed weather record"),
        }
    }
}

impl MessageHandler for Weather {
    fn handle(&mut self, record: &ConsumedRecord) { self.process_message(record) }
}

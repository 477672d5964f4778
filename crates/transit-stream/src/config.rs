use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Kafka bootstrap servers (e.g., "localhost:9092", "kafka0:9092" in docker).
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Schema Registry base URL (e.g., "http://schema-registry:8081" in docker).
    #[serde(default = "default_schema_registry_url")]
    pub schema_registry_url: String,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default = "default_weather_topic")]
    pub weather_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Pause between bursts once a poll comes back empty.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: f64,

    /// How long a single poll waits for a message.
    #[serde(default = "default_consume_timeout_ms")]
    pub consume_timeout_ms: u64,

    #[serde(default)]
    pub offset_earliest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,

    #[serde(default = "default_queue_buffering_max_messages")]
    pub queue_buffering_max_messages: u32,

    #[serde(default = "default_batch_num_messages")]
    pub batch_num_messages: u32,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

/// Settings for the stations stream agent and its table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Application id, also used as the consumer group.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    #[serde(default = "default_source_topic")]
    pub source_topic: String,

    #[serde(default = "default_table_name")]
    pub table_name: String,

    #[serde(default = "default_changelog_topic")]
    pub changelog_topic: String,

    #[serde(default = "default_changelog_partitions")]
    pub changelog_partitions: i32,

    /// Rebuild the table from its changelog before consuming.
    #[serde(default = "default_recover_on_start")]
    pub recover_on_start: bool,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_schema_registry_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_weather_topic() -> String {
    "org.chicago.cta.weather.v1".to_string()
}

fn default_group_id() -> String {
    "0-take2".to_string()
}

fn default_sleep_secs() -> f64 {
    1.0
}

fn default_consume_timeout_ms() -> u64 {
    100
}

fn default_message_timeout_ms() -> u32 {
    5000
}

fn default_queue_buffering_max_messages() -> u32 {
    100000
}

fn default_batch_num_messages() -> u32 {
    1000
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_app_id() -> String {
    "stations-stream".to_string()
}

fn default_source_topic() -> String {
    "connect_stations".to_string()
}

fn default_table_name() -> String {
    "transformed_stations".to_string()
}

fn default_changelog_topic() -> String {
    "org.chicago.cta.stations.table.v1".to_string()
}

fn default_changelog_partitions() -> i32 {
    1
}

fn default_recover_on_start() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            schema_registry_url: default_schema_registry_url(),
            consumer: ConsumerConfig::default(),
            producer: ProducerConfig::default(),
            stream: StreamConfig::default(),
            weather_topic: default_weather_topic(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            sleep_secs: default_sleep_secs(),
            consume_timeout_ms: default_consume_timeout_ms(),
            offset_earliest: false,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: default_message_timeout_ms(),
            queue_buffering_max_messages: default_queue_buffering_max_messages(),
            batch_num_messages: default_batch_num_messages(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            source_topic: default_source_topic(),
            table_name: default_table_name(),
            changelog_topic: default_changelog_topic(),
            changelog_partitions: default_changelog_partitions(),
            recover_on_start: default_recover_on_start(),
        }
    }
}

impl PipelineConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Load a TOML config file. Missing keys fall back to the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

impl ConsumerConfig {
    /// Pause between poll bursts. Negative, NaN or out-of-range values fall back to the
    /// default.
    pub fn sleep(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleep_secs).unwrap_or_else(|e| {
            tracing::warn!(sleep_secs = self.sleep_secs, %e, "Invalid consumer sleep, using default");
            Duration::from_secs_f64(default_sleep_secs())
        })
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms)
    }
}

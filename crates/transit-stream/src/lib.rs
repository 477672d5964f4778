pub mod agent;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod handler;
pub mod producer;
pub mod schema_registry;
pub mod table;
pub mod topics;
pub mod utils;
pub mod weather;

// Re-export main types
pub use agent::{create_source_consumer, StationAgent, StationTable};
pub use config::{ConsumerConfig, PipelineConfig, ProducerConfig, StreamConfig};
pub use consumer::{ConsumerOptions, RecordConsumer};
pub use error::{Error, Result};
pub use events::{determine_line, Line, Station, TransformedStation, WeatherKey, WeatherReading};
pub use handler::{ConsumedRecord, MessageHandler, Payload};
pub use producer::{create_producer, ProducerSpec, RecordProducer};
pub use schema_registry::SchemaRegistryClient;
pub use table::{recover_table, Changelog, KafkaChangelog, Table};
pub use topics::{TopicProvisioner, TopicSpec};
pub use utils::time_millis;
pub use weather::Weather;

// Re-export rdkafka/avro types for convenience
pub use apache_avro::Schema;
pub use rdkafka::producer::FutureProducer;

use rdkafka::error::KafkaError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kafka: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Schema Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Schema Registry returned {status} for {subject}: {message}")]
    SchemaRegistry {
        subject: String,
        status: u16,
        message: String,
    },

    #[error("Avro: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wire format: {0}")]
    WireFormat(String),

    #[error("Cannot convert {value} to Avro {schema}")]
    AvroConversion { value: String, schema: String },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

use std::time::Duration;

use apache_avro::Schema;
use rdkafka::{
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig,
};
use serde::Serialize;

use crate::{
    codec::AvroSerializer,
    config::PipelineConfig,
    error::Result,
    schema_registry::{key_subject, value_subject, SchemaRegistryClient},
    topics::{TopicProvisioner, TopicSpec},
    utils::time_millis,
};

/// Build a producer with the configured batching and delivery-timeout knobs.
pub fn create_producer(config: &PipelineConfig) -> Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set(
            "message.timeout.ms",
            config.producer.message_timeout_ms.to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.producer.queue_buffering_max_messages.to_string(),
        )
        .set(
            "batch.num.messages",
            config.producer.batch_num_messages.to_string(),
        )
        .create()?;
    Ok(producer)
}

/// Topic, schemas and sizing of a [`RecordProducer`].
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    pub topic_name: String,
    pub key_schema: Schema,
    pub value_schema: Option<Schema>,
    pub num_partitions: i32,
    pub num_replicas: i32,
}

impl ProducerSpec {
    pub fn new(topic_name: impl Into<String>, key_schema: Schema) -> Self {
        Self {
            topic_name: topic_name.into(),
            key_schema,
            value_schema: None,
            num_partitions: 1,
            num_replicas: 1,
        }
    }

    pub fn value_schema(mut self, schema: Schema) -> Self {
        self.value_schema = Some(schema);
        self
    }

    pub fn partitions(mut self, num_partitions: i32) -> Self {
        self.num_partitions = num_partitions;
        self
    }

    pub fn replicas(mut self, num_replicas: i32) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    fn topic(&self) -> TopicSpec {
        TopicSpec::new(&self.topic_name)
            .partitions(self.num_partitions)
            .replicas(self.num_replicas)
    }
}

/// Avro producer bound to one topic, which it makes sure exists before first use.
pub struct RecordProducer {
    topic_name: String,
    producer: FutureProducer,
    key_serializer: AvroSerializer,
    value_serializer: Option<AvroSerializer>,
    flush_timeout: Duration,
}

impl std::fmt::Debug for RecordProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordProducer")
            .field("topic_name", &self.topic_name)
            .field("key_schema_id", &self.key_serializer.schema_id())
            .field(
                "value_schema_id",
                &self.value_serializer.as_ref().map(AvroSerializer::schema_id),
            )
            .finish()
    }
}

impl RecordProducer {
    pub async fn new(
        config: &PipelineConfig,
        provisioner: &TopicProvisioner,
        registry: &SchemaRegistryClient,
        spec: ProducerSpec,
    ) -> Result<Self> {
        if !provisioner.is_known(&spec.topic_name).await {
            provisioner.ensure_topic(&spec.topic()).await;
        }

        let key_id = registry
            .register(&key_subject(&spec.topic_name), &serde_json::to_string(&spec.key_schema)?)
            .await?;
        let value_serializer = match spec.value_schema {
            Some(schema) => {
                let id = registry
                    .register(&value_subject(&spec.topic_name), &serde_json::to_string(&schema)?)
                    .await?;
                Some(AvroSerializer::new(schema, id))
            },
            None => None,
        };

        tracing::info!(
            topic = %spec.topic_name,
            key_schema_id = key_id,
            "Producer ready"
        );

        Ok(Self {
            topic_name: spec.topic_name,
            producer: create_producer(config)?,
            key_serializer: AvroSerializer::new(spec.key_schema, key_id),
            value_serializer,
            flush_timeout: Duration::from_millis(config.producer.flush_timeout_ms),
        })
    }

    pub fn topic_name(&self) -> &str { &self.topic_name }

    /// Encode and publish one record. A `None` value publishes a tombstone.
    /// Returns the (partition, offset) the broker assigned.
    pub async fn produce<K, V>(&self, key: &K, value: Option<&V>) -> Result<(i32, i64)>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key_bytes = self.key_serializer.serialize(key)?;
        let value_bytes = match (value, &self.value_serializer) {
            (Some(value), Some(serializer)) => Some(serializer.serialize(value)?),
            // Without a value schema the value is sent as JSON.
            (Some(value), None) => Some(serde_json::to_vec(value)?),
            (None, _) => None,
        };

        let mut record = FutureRecord::to(&self.topic_name).key(&key_bytes);
        if let Some(ref payload) = value_bytes {
            record = record.payload(payload);
        }

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| e)?;

        tracing::debug!(
            topic = %self.topic_name,
            partition = delivery.0,
            offset = delivery.1,
            "Record produced"
        );
        Ok(delivery)
    }

    /// Flush outstanding messages. Failures are logged.
    pub fn close(&self) {
        if let Err(e) = self.producer.flush(self.flush_timeout) {
            tracing::error!(?e, topic = %self.topic_name, "Failed to flush producer");
        }
    }

    /// Key for time-keyed events.
    pub fn time_millis() -> i64 { time_millis() }
}

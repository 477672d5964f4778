//! Polling consumer that hands every record to a [`MessageHandler`].
//!
//! Each `consume_once` polls with a short timeout. Records keep the inner loop going;
//! the first empty poll ends the burst and the consumer sleeps before polling again.

use std::{sync::Mutex, time::Duration};

use rdkafka::{
    consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer},
    message::OwnedMessage,
    ClientConfig, ClientContext, Message, Offset, TopicPartitionList,
};

use crate::{
    codec::{is_framed, AvroDeserializer},
    config::{ConsumerConfig, PipelineConfig},
    error::Result,
    handler::{ConsumedRecord, MessageHandler, Payload},
    schema_registry::SchemaRegistryClient,
    utils::format_partitions,
};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Topic name, or a regex when it starts with `^`.
    pub topic_name_pattern: String,
    pub group_id: String,
    /// Decode Confluent-framed Avro keys and values through the Schema Registry.
    pub is_avro: bool,
    /// Start every newly assigned partition from its first offset.
    pub offset_earliest: bool,
    pub sleep: Duration,
    pub consume_timeout: Duration,
}

impl ConsumerOptions {
    pub fn new(topic_name_pattern: impl Into<String>, config: &ConsumerConfig) -> Self {
        Self {
            topic_name_pattern: topic_name_pattern.into(),
            group_id: config.group_id.clone(),
            is_avro: true,
            offset_earliest: config.offset_earliest,
            sleep: config.sleep(),
            consume_timeout: config.consume_timeout(),
        }
    }

    pub fn is_avro(mut self, is_avro: bool) -> Self {
        self.is_avro = is_avro;
        self
    }

    pub fn offset_earliest(mut self, offset_earliest: bool) -> Self {
        self.offset_earliest = offset_earliest;
        self
    }

    fn auto_offset_reset(&self) -> &'static str {
        if self.offset_earliest {
            "earliest"
        } else {
            "latest"
        }
    }
}

/// Copy of an assignment with every partition pointed at its first offset.
pub fn rewind_to_beginning(tpl: &TopicPartitionList) -> Result<TopicPartitionList> {
    let mut rewound = tpl.clone();
    rewound.set_all_offsets(Offset::Beginning)?;
    Ok(rewound)
}

/// Receives rebalance callbacks. Assignments that must start from the beginning are
/// parked here and applied by the poll that served the rebalance.
pub struct AssignmentContext {
    topic_name_pattern: String,
    offset_earliest: bool,
    pending: Mutex<Option<TopicPartitionList>>,
}

impl AssignmentContext {
    fn new(options: &ConsumerOptions) -> Self {
        Self {
            topic_name_pattern: options.topic_name_pattern.clone(),
            offset_earliest: options.offset_earliest,
            pending: Mutex::new(None),
        }
    }

    fn take_pending(&self) -> Option<TopicPartitionList> {
        self.pending.lock().ok().and_then(|mut pending| pending.take())
    }
}

impl ClientContext for AssignmentContext {}

impl ConsumerContext for AssignmentContext {
    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                tracing::info!(
                    partitions = %format_partitions(tpl),
                    "partitions assigned for {}",
                    self.topic_name_pattern
                );
                if !self.offset_earliest {
                    return;
                }
                match rewind_to_beginning(tpl) {
                    Ok(rewound) => {
                        if let Ok(mut pending) = self.pending.lock() {
                            *pending = Some(rewound);
                        }
                    },
                    Err(e) => tracing::error!(?e, "Failed to rewind assignment"),
                }
            },
            Rebalance::Revoke(tpl) => {
                tracing::info!(
                    partitions = %format_partitions(tpl),
                    "partitions revoked for {}",
                    self.topic_name_pattern
                );
            },
            Rebalance::Error(err) => {
                tracing::error!(%err, topic = %self.topic_name_pattern, "Rebalance error");
            },
        }
    }
}

pub struct RecordConsumer<H> {
    consumer: StreamConsumer<AssignmentContext>,
    options: ConsumerOptions,
    decoder: Option<AvroDeserializer>,
    handler: H,
}

impl<H> std::fmt::Debug for RecordConsumer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordConsumer")
            .field("options", &self.options)
            .finish()
    }
}

impl<H: MessageHandler> RecordConsumer<H> {
    /// Build the consumer and subscribe it to `options.topic_name_pattern`.
    pub fn new(config: &PipelineConfig, options: ConsumerOptions, handler: H) -> Result<Self> {
        let consumer: StreamConsumer<AssignmentContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &options.group_id)
            .set("auto.offset.reset", options.auto_offset_reset())
            .create_with_context(AssignmentContext::new(&options))?;

        consumer.subscribe(&[options.topic_name_pattern.as_str()])?;

        let decoder = if options.is_avro {
            let registry = SchemaRegistryClient::new(&config.schema_registry_url)?;
            Some(AvroDeserializer::new(registry))
        } else {
            None
        };

        tracing::info!(
            topic = %options.topic_name_pattern,
            group_id = %options.group_id,
            is_avro = options.is_avro,
            offset_earliest = options.offset_earliest,
            "Consumer subscribed"
        );

        Ok(Self {
            consumer,
            options,
            decoder,
            handler,
        })
    }

    /// Poll forever: drain records while they keep coming, then sleep.
    pub async fn consume(&mut self) {
        loop {
            while self.consume_once().await > 0 {}
            tokio::time::sleep(self.options.sleep).await;
        }
    }

    /// Poll for one record. Returns 1 if a record was handled, 0 otherwise.
    pub async fn consume_once(&mut self) -> usize {
        let polled = tokio::time::timeout(self.options.consume_timeout, self.consumer.recv())
            .await
            .map(|result| result.map(|msg| msg.detach()));

        // A record polled alongside an assignment comes from the un-rewound position.
        // It is dropped and read again once the rewind is applied.
        if self.apply_pending_assignment() {
            return 0;
        }

        match polled {
            Err(_elapsed) => {
                tracing::info!(
                    "No message received by consumer in topic {}",
                    self.options.topic_name_pattern
                );
                0
            },
            Ok(Err(e)) => {
                tracing::error!(?e, "Error from consumer");
                0
            },
            Ok(Ok(msg)) => match self.decode(&msg).await {
                Ok(record) => {
                    self.handler.handle(&record);
                    tracing::info!(%record, "Consumer message");
                    1
                },
                Err(e) => {
                    tracing::error!(
                        ?e,
                        topic = msg.topic(),
                        partition = msg.partition(),
                        offset = msg.offset(),
                        "Failed to decode message"
                    );
                    0
                },
            },
        }
    }

    /// Unsubscribe and drop the client.
    pub fn close(self) -> H {
        self.consumer.unsubscribe();
        tracing::info!(topic = %self.options.topic_name_pattern, "Consumer closed");
        self.handler
    }

    /// Assign a parked rewind, if any. Returns whether one was pending.
    fn apply_pending_assignment(&self) -> bool {
        let Some(rewound) = self.consumer.context().take_pending() else {
            return false;
        };
        match self.consumer.assign(&rewound) {
            Ok(()) => tracing::debug!(
                partitions = %format_partitions(&rewound),
                "Assignment rewound to beginning"
            ),
            Err(e) => tracing::error!(?e, "Failed to apply rewound assignment"),
        }
        true
    }

    async fn decode(&mut self, msg: &OwnedMessage) -> Result<ConsumedRecord> {
        let key = match msg.key() {
            Some(bytes) => Some(self.decode_payload(bytes).await?),
            None => None,
        };
        let value = match msg.payload() {
            Some(bytes) => Some(self.decode_payload(bytes).await?),
            None => None,
        };

        Ok(ConsumedRecord {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            value,
        })
    }

    async fn decode_payload(&mut self, bytes: &[u8]) -> Result<Payload> {
        match self.decoder {
            Some(ref mut decoder) if is_framed(bytes) => {
                Ok(Payload::Decoded(decoder.deserialize(bytes).await?))
            },
            _ => Ok(Payload::Raw(bytes.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rdkafka::{mocking::MockCluster, producer::FutureRecord};

    use super::*;
    use crate::producer::create_producer;

    const WEATHER_TOPIC: &str = "org.chicago.cta.weather.v1";

    fn assignment() -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset("org.chicago.cta.weather.v1", 0, Offset::Offset(120))
            .unwrap();
        tpl.add_partition_offset("org.chicago.cta.weather.v1", 1, Offset::Stored)
            .unwrap();
        tpl
    }

    #[test]
    fn rewind_points_every_partition_at_beginning() {
        let rewound = rewind_to_beginning(&assignment()).unwrap();
        let elements = rewound.elements();
        assert_eq!(elements.len(), 2);
        for (i, elem) in elements.iter().enumerate() {
            assert_eq!(elem.topic(), "org.chicago.cta.weather.v1");
            assert_eq!(elem.partition(), i as i32);
            assert_eq!(elem.offset(), Offset::Beginning);
        }
    }

    #[test]
    fn assignment_is_parked_only_when_offset_earliest() {
        let config = ConsumerConfig::default();

        let latest = AssignmentContext::new(&ConsumerOptions::new("connect_stations", &config));
        latest.post_rebalance(&Rebalance::Assign(&assignment()));
        assert!(latest.take_pending().is_none());

        let earliest = AssignmentContext::new(
            &ConsumerOptions::new("connect_stations", &config).offset_earliest(true),
        );
        earliest.post_rebalance(&Rebalance::Assign(&assignment()));
        let pending = earliest.take_pending().expect("assignment parked");
        assert_eq!(pending.count(), 2);
        // Taken once.
        assert!(earliest.take_pending().is_none());
    }

    #[test]
    fn options_follow_consumer_config() {
        let options = ConsumerOptions::new("^org.chicago.cta.station.arrivals.*", &ConsumerConfig::default())
            .is_avro(false);
        assert_eq!(options.group_id, "0-take2");
        assert_eq!(options.auto_offset_reset(), "latest");
        assert_eq!(options.consume_timeout, Duration::from_millis(100));
        assert!(!options.is_avro);
        assert_eq!(options.offset_earliest(true).auto_offset_reset(), "earliest");
    }

    #[tokio::test]
    async fn empty_poll_returns_zero() {
        // Nothing listens on port 1, so every poll comes back empty.
        let config = PipelineConfig::new("127.0.0.1:1");
        let options = ConsumerOptions::new(WEATHER_TOPIC, &config.consumer).is_avro(false);
        let mut consumer = RecordConsumer::new(&config, options, |_: &ConsumedRecord| {}).unwrap();

        assert_eq!(consumer.consume_once().await, 0);
        assert_eq!(consumer.consume_once().await, 0);
        consumer.close();
    }

    #[tokio::test]
    async fn offset_earliest_handles_each_record_once_in_order() {
        let cluster = MockCluster::new(1).unwrap();
        cluster.create_topic(WEATHER_TOPIC, 1, 1).unwrap();
        let config = PipelineConfig::new(cluster.bootstrap_servers());

        let producer = create_producer(&config).unwrap();
        for i in 0..3 {
            let key = i.to_string();
            producer
                .send(
                    FutureRecord::to(WEATHER_TOPIC).key(&key).payload("{}"),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handled = Arc::clone(&seen);
        let mut options = ConsumerOptions::new(WEATHER_TOPIC, &config.consumer)
            .is_avro(false)
            .offset_earliest(true);
        options.consume_timeout = Duration::from_secs(1);
        let mut consumer = RecordConsumer::new(&config, options, move |record: &ConsumedRecord| {
            handled.lock().unwrap().push(record.offset)
        })
        .unwrap();

        for _ in 0..60 {
            consumer.consume_once().await;
            if seen.lock().unwrap().len() >= 3 {
                break;
            }
        }
        consumer.close();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}

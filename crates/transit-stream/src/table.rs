//! In-memory keyed table persisted through a compacted changelog topic.
//!
//! Every write goes to the changelog first and then to memory, so the changelog can
//! rebuild the table after a restart.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use rdkafka::{
    consumer::{BaseConsumer, Consumer},
    error::KafkaResult,
    producer::{FutureProducer, FutureRecord},
    ClientConfig, Message, Offset, TopicPartitionList,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{config::PipelineConfig, error::Result};

const RECOVERY_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive read errors after which changelog recovery gives up.
const RECOVERY_MAX_ERRORS: u32 = 10;

/// Destination of table updates.
pub trait Changelog: Send + Sync {
    /// Persist one update. `None` is a deletion (tombstone).
    fn append(
        &self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Changelog backed by a Kafka topic.
#[derive(Clone)]
pub struct KafkaChangelog {
    producer: Arc<FutureProducer>,
    topic: String,
}

impl std::fmt::Debug for KafkaChangelog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaChangelog")
            .field("topic", &self.topic)
            .finish()
    }
}

impl KafkaChangelog {
    pub fn new(producer: Arc<FutureProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

impl Changelog for KafkaChangelog {
    async fn append(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        let mut record = FutureRecord::to(&self.topic).key(&key);
        if let Some(ref payload) = value {
            record = record.payload(payload);
        }

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| e)?;
        Ok(())
    }
}

pub struct Table<K, V, C> {
    name: String,
    entries: HashMap<K, V>,
    changelog: C,
}

impl<K, V, C> std::fmt::Debug for Table<K, V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<K, V, C> Table<K, V, C>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
    C: Changelog,
{
    pub fn new(name: impl Into<String>, changelog: C) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
            changelog,
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn changelog(&self) -> &C { &self.changelog }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn get(&self, key: &K) -> Option<&V> { self.entries.get(key) }

    /// Value for `key`, or `V::default()` when the key was never written.
    pub fn get_or_default(&self, key: &K) -> V
    where
        V: Default,
    {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> { self.entries.iter() }

    /// Write to the changelog, then to memory. A failed changelog write leaves the
    /// table unchanged.
    pub async fn insert(&mut self, key: K, value: V) -> Result<()> {
        let key_bytes = serde_json::to_vec(&key)?;
        let value_bytes = serde_json::to_vec(&value)?;
        self.changelog.append(key_bytes, Some(value_bytes)).await?;
        self.entries.insert(key, value);
        Ok(())
    }

    pub async fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let key_bytes = serde_json::to_vec(key)?;
        self.changelog.append(key_bytes, None).await?;
        Ok(self.entries.remove(key))
    }

    /// Replay one changelog entry into memory without writing it back.
    pub fn apply_changelog_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let key: K = serde_json::from_slice(key)?;
        match value {
            Some(value) => {
                let value: V = serde_json::from_slice(value)?;
                self.entries.insert(key, value);
            },
            None => {
                self.entries.remove(&key);
            },
        }
        Ok(())
    }
}

/// Rebuild `table` by reading its changelog topic from the beginning of every partition
/// up to the high watermark observed at start. Returns the number of entries replayed.
/// Entries that fail to decode are logged and skipped.
pub fn recover_table<K, V, C>(
    config: &PipelineConfig,
    changelog_topic: &str,
    table: &mut Table<K, V, C>,
) -> Result<u64>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
    C: Changelog,
{
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", format!("{}-recovery", config.stream.app_id))
        .set("enable.auto.commit", "false")
        .create()?;

    let metadata = consumer.fetch_metadata(Some(changelog_topic), RECOVERY_POLL_TIMEOUT)?;
    let Some(topic_metadata) = metadata
        .topics()
        .iter()
        .find(|t| t.name() == changelog_topic && t.error().is_none())
    else {
        tracing::info!(topic = changelog_topic, "Changelog topic missing - starting empty");
        return Ok(0);
    };

    let mut tpl = TopicPartitionList::new();
    let mut remaining = HashMap::new();
    for partition in topic_metadata.partitions() {
        let (low, high) =
            consumer.fetch_watermarks(changelog_topic, partition.id(), RECOVERY_POLL_TIMEOUT)?;
        if high > low {
            tpl.add_partition_offset(changelog_topic, partition.id(), Offset::Beginning)?;
            remaining.insert(partition.id(), high);
        }
    }

    if remaining.is_empty() {
        tracing::info!(topic = changelog_topic, "Changelog empty - starting empty");
        return Ok(0);
    }

    consumer.assign(&tpl)?;

    let consumer = &consumer;
    let replayed = replay_changelog(table, changelog_topic, remaining, move || {
        consumer.poll(RECOVERY_POLL_TIMEOUT)
    });

    tracing::info!(
        table = table.name(),
        topic = changelog_topic,
        replayed,
        entries = table.len(),
        "Table recovered from changelog"
    );
    Ok(replayed)
}

/// Apply polled changelog records until every partition in `remaining` has reached its
/// high watermark. Stops early on a poll timeout or after `RECOVERY_MAX_ERRORS`
/// consecutive read errors.
fn replay_changelog<K, V, C, M>(
    table: &mut Table<K, V, C>,
    changelog_topic: &str,
    mut remaining: HashMap<i32, i64>,
    mut poll: impl FnMut() -> Option<KafkaResult<M>>,
) -> u64
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
    C: Changelog,
    M: Message,
{
    let mut replayed = 0u64;
    let mut errors = 0u32;
    while !remaining.is_empty() {
        let msg = match poll() {
            Some(Ok(msg)) => {
                errors = 0;
                msg
            },
            Some(Err(e)) => {
                errors += 1;
                tracing::warn!(?e, topic = changelog_topic, errors, "Error reading changelog");
                if errors >= RECOVERY_MAX_ERRORS {
                    tracing::warn!(
                        topic = changelog_topic,
                        replayed,
                        "Too many changelog read errors, giving up on recovery"
                    );
                    break;
                }
                continue;
            },
            None => {
                tracing::warn!(
                    topic = changelog_topic,
                    replayed,
                    "Changelog read timed out before reaching the high watermark"
                );
                break;
            },
        };

        if let Some(key) = msg.key() {
            match table.apply_changelog_entry(key, msg.payload()) {
                Ok(()) => replayed += 1,
                Err(e) => tracing::warn!(?e, offset = msg.offset(), "Skipping changelog entry"),
            }
        }

        if let Some(&high) = remaining.get(&msg.partition()) {
            if msg.offset() + 1 >= high {
                remaining.remove(&msg.partition());
            }
        }
    }
    replayed
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use rdkafka::{
        error::KafkaError,
        message::{OwnedMessage, Timestamp},
        mocking::MockCluster,
        types::RDKafkaErrorCode,
    };

    use super::*;
    use crate::{error::Error, producer::create_producer};

    const CHANGELOG_TOPIC: &str = "org.chicago.cta.stations.table.v1";

    fn entry(offset: i64, key: &str, value: Option<&str>) -> OwnedMessage {
        OwnedMessage::new(
            value.map(|v| v.as_bytes().to_vec()),
            Some(key.as_bytes().to_vec()),
            CHANGELOG_TOPIC.to_string(),
            Timestamp::NotAvailable,
            0,
            offset,
            None,
        )
    }

    /// Changelog that records appends in memory.
    #[derive(Debug, Default)]
    pub struct MemoryChangelog {
        pub entries: Mutex<Vec<(Vec<u8>, Option<Vec<u8>>)>>,
        pub fail: bool,
    }

    impl Changelog for MemoryChangelog {
        async fn append(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
            if self.fail {
                return Err(Error::WireFormat("changelog unavailable".to_string()));
            }
            self.entries.lock().unwrap().push((key, value));
            Ok(())
        }
    }

    #[tokio::test]
    async fn insert_writes_changelog_then_memory() {
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());

        table.insert(40010, "Austin".to_string()).await.unwrap();
        table.insert(40010, "Austin (Blue)".to_string()).await.unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&40010).map(String::as_str), Some("Austin (Blue)"));

        let entries = table.changelog().entries.lock().unwrap().clone();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0, b"40010".to_vec());
        assert_eq!(entries[1].1, Some(b"\"Austin (Blue)\"".to_vec()));
    }

    #[tokio::test]
    async fn failed_changelog_write_leaves_table_unchanged() {
        let changelog = MemoryChangelog {
            fail: true,
            ..Default::default()
        };
        let mut table: Table<i64, String, _> = Table::new("names", changelog);

        assert!(table.insert(1, "Clark/Lake".to_string()).await.is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn remove_appends_tombstone() {
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());
        table.insert(7, "Belmont".to_string()).await.unwrap();

        assert_eq!(table.remove(&7).await.unwrap(), Some("Belmont".to_string()));
        assert!(table.is_empty());
        let entries = table.changelog().entries.lock().unwrap().clone();
        assert_eq!(entries.last(), Some(&(b"7".to_vec(), None)));
    }

    #[test]
    fn replayed_entries_rebuild_table() {
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());

        table.apply_changelog_entry(b"1", Some(b"\"Howard\"".as_slice())).unwrap();
        table.apply_changelog_entry(b"2", Some(b"\"Jarvis\"".as_slice())).unwrap();
        table.apply_changelog_entry(b"1", None).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get_or_default(&2), "Jarvis");
        assert_eq!(table.get_or_default(&1), "");
        assert!(table.apply_changelog_entry(b"not-a-key", None).is_err());
        // Replay never writes back to the changelog.
        assert!(table.changelog().entries.lock().unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_high_watermark() {
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());
        let mut polled = vec![
            entry(0, "1", Some("\"Howard\"")),
            entry(1, "2", Some("\"Jarvis\"")),
            entry(2, "1", None),
            entry(3, "3", Some("\"Morse\"")),
        ]
        .into_iter();

        let replayed = replay_changelog(&mut table, CHANGELOG_TOPIC, HashMap::from([(0, 3)]), || {
            polled.next().map(Ok)
        });

        assert_eq!(replayed, 3);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&2).map(String::as_str), Some("Jarvis"));
        // Past the watermark, never read.
        assert_eq!(polled.len(), 1);
    }

    #[test]
    fn replay_gives_up_after_repeated_errors() {
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());
        let mut polls = 0u32;

        let replayed = replay_changelog(&mut table, CHANGELOG_TOPIC, HashMap::from([(0, 5)]), || {
            polls += 1;
            Some(Err::<OwnedMessage, _>(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure,
            )))
        });

        assert_eq!(replayed, 0);
        assert_eq!(polls, RECOVERY_MAX_ERRORS);
        assert!(table.is_empty());
    }

    #[test]
    fn replay_error_streak_resets_on_success() {
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());
        let mut polls = 0u32;

        let replayed = replay_changelog(&mut table, CHANGELOG_TOPIC, HashMap::from([(0, 1)]), || {
            polls += 1;
            if polls == RECOVERY_MAX_ERRORS {
                Some(Ok(entry(0, "1", Some("\"Howard\""))))
            } else {
                Some(Err(KafkaError::MessageConsumption(
                    RDKafkaErrorCode::BrokerTransportFailure,
                )))
            }
        });

        assert_eq!(replayed, 1);
        assert_eq!(table.get(&1).map(String::as_str), Some("Howard"));
    }

    #[tokio::test]
    async fn recovery_from_missing_or_empty_changelog_starts_empty() {
        let cluster = MockCluster::new(1).unwrap();
        let config = PipelineConfig::new(cluster.bootstrap_servers());
        let mut table: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());

        assert_eq!(recover_table(&config, CHANGELOG_TOPIC, &mut table).unwrap(), 0);
        assert!(table.is_empty());

        cluster.create_topic(CHANGELOG_TOPIC, 1, 1).unwrap();
        assert_eq!(recover_table(&config, CHANGELOG_TOPIC, &mut table).unwrap(), 0);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn recovery_replays_changelog_written_by_kafka_changelog() {
        let cluster = MockCluster::new(1).unwrap();
        cluster.create_topic(CHANGELOG_TOPIC, 1, 1).unwrap();
        let config = PipelineConfig::new(cluster.bootstrap_servers());

        let producer = Arc::new(create_producer(&config).unwrap());
        let changelog = KafkaChangelog::new(producer, CHANGELOG_TOPIC);
        let mut written: Table<i64, String, _> = Table::new("names", changelog);
        written.insert(40900, "Howard".to_string()).await.unwrap();
        written.insert(40890, "O'Hare".to_string()).await.unwrap();
        written.remove(&40900).await.unwrap();

        let mut restored: Table<i64, String, _> = Table::new("names", MemoryChangelog::default());
        assert_eq!(recover_table(&config, CHANGELOG_TOPIC, &mut restored).unwrap(), 3);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(&40890).map(String::as_str), Some("O'Hare"));
    }
}

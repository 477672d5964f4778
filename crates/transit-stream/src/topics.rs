use std::{collections::HashSet, sync::Arc, time::Duration};

use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    ClientConfig,
};
use tokio::sync::Mutex;

use crate::{config::PipelineConfig, error::Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic to create when it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub num_partitions: i32,
    pub num_replicas: i32,
    /// Extra topic-level configs (e.g. `cleanup.policy`).
    pub configs: Vec<(String, String)>,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_partitions: 1,
            num_replicas: 1,
            configs: Vec::new(),
        }
    }

    pub fn partitions(mut self, num_partitions: i32) -> Self {
        self.num_partitions = num_partitions;
        self
    }

    pub fn replicas(mut self, num_replicas: i32) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configs.push((key.into(), value.into()));
        self
    }

    /// Log-compacted topic, used for table changelogs.
    pub fn compacted(name: impl Into<String>) -> Self {
        Self::new(name).config("cleanup.policy", "compact")
    }
}

/// Creates topics on first use and remembers which ones are known to exist.
///
/// Clones share the known-topic set, so every producer built from the same provisioner
/// checks the broker at most once per topic.
#[derive(Clone)]
pub struct TopicProvisioner {
    admin: Arc<AdminClient<DefaultClientContext>>,
    known: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for TopicProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProvisioner")
            .field("known", &self.known.try_lock().map(|k| k.len()).ok())
            .finish()
    }
}

impl TopicProvisioner {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let admin: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .create()?;

        Ok(Self {
            admin: Arc::new(admin),
            known: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub async fn is_known(&self, topic: &str) -> bool { self.known.lock().await.contains(topic) }

    /// Creates the topic if it does not already exist.
    ///
    /// Never fails: metadata and creation errors are logged, and the topic is recorded as
    /// known either way so later producers don't retry.
    pub async fn ensure_topic(&self, spec: &TopicSpec) {
        let mut known = self.known.lock().await;
        if known.contains(&spec.name) {
            return;
        }

        match self.topic_exists(&spec.name).await {
            Ok(true) => tracing::debug!(topic = %spec.name, "Topic already exists"),
            Ok(false) => {
                tracing::info!(topic = %spec.name, "Topic {} will be created", spec.name);
                self.create_topic(spec).await;
            },
            Err(e) => tracing::error!(?e, topic = %spec.name, "Failed to list topics"),
        }

        known.insert(spec.name.clone());
    }

    pub async fn ensure_topics(&self, specs: &[TopicSpec]) {
        for spec in specs {
            self.ensure_topic(spec).await;
        }
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let admin = Arc::clone(&self.admin);
        let name = topic.to_string();

        // Metadata requests block the calling thread.
        let metadata = tokio::task::spawn_blocking(move || {
            admin.inner().fetch_metadata(Some(&name), METADATA_TIMEOUT)
        })
        .await??;

        // A missing topic comes back as an entry carrying UnknownTopicOrPartition.
        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.name() == topic && t.error().is_none()))
    }

    async fn create_topic(&self, spec: &TopicSpec) {
        let mut new_topic = NewTopic::new(
            &spec.name,
            spec.num_partitions,
            TopicReplication::Fixed(spec.num_replicas),
        );
        for (key, value) in &spec.configs {
            new_topic = new_topic.set(key, value);
        }

        match self
            .admin
            .create_topics([&new_topic], &AdminOptions::new())
            .await
        {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(topic) => tracing::info!(
                            topic,
                            partitions = spec.num_partitions,
                            replicas = spec.num_replicas,
                            "Topic created"
                        ),
                        Err((topic, err)) => {
                            if err == rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists {
                                tracing::debug!(topic, "Topic already exists");
                            } else {
                                tracing::error!(?err, topic, "Failed to create topic");
                            }
                        },
                    }
                }
            },
            Err(e) => tracing::error!(?e, topic = %spec.name, "Failed to create topic"),
        }
    }
}

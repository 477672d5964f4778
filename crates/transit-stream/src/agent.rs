//! Stations stream agent: enriches station records with their line and keeps the
//! result in a changelog-backed table keyed by station id.

use futures::StreamExt;
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    ClientConfig, Message,
};

use crate::{
    config::PipelineConfig,
    error::{Error, Result},
    events::{Station, TransformedStation},
    table::{Changelog, Table},
};

pub type StationTable<C> = Table<i64, TransformedStation, C>;

/// Consumer for the stations source topic, in the agent's own group.
pub fn create_source_consumer(config: &PipelineConfig) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.stream.app_id)
        .set("auto.offset.reset", "earliest")
        .create()?;
    consumer.subscribe(&[config.stream.source_topic.as_str()])?;
    Ok(consumer)
}

pub struct StationAgent<C> {
    table: StationTable<C>,
}

impl<C> std::fmt::Debug for StationAgent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationAgent")
            .field("table", &self.table)
            .finish()
    }
}

impl<C: Changelog> StationAgent<C> {
    pub fn new(table: StationTable<C>) -> Self { Self { table } }

    pub fn table(&self) -> &StationTable<C> { &self.table }

    pub fn table_mut(&mut self) -> &mut StationTable<C> { &mut self.table }

    /// `table[station_id] = TransformedStation { .. }`.
    pub async fn process(&mut self, station: &Station) -> Result<()> {
        let transformed = TransformedStation::from(station);
        let line = transformed.line;
        self.table.insert(station.station_id, transformed).await?;
        tracing::debug!(station_id = station.station_id, %line, "Station transformed");
        Ok(())
    }

    /// Decode a JSON station record and process it.
    pub async fn process_payload(&mut self, payload: &[u8]) -> Result<()> {
        let station: Station = serde_json::from_slice(payload)?;
        self.process(&station).await
    }

    /// Consume the source topic until the stream ends. Undecodable records are skipped,
    /// failed table writes are logged.
    pub async fn run(mut self, consumer: StreamConsumer) {
        tracing::info!(table = self.table.name(), "Stations agent started");

        let mut stream = consumer.stream();
        while let Some(result) = stream.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(?e, "Error from stations consumer");
                    continue;
                },
            };

            let Some(payload) = msg.payload() else {
                tracing::debug!(offset = msg.offset(), "Skipping station record without value");
                continue;
            };

            match self.process_payload(payload).await {
                Ok(()) => {},
                Err(Error::Json(e)) => tracing::warn!(
                    ?e,
                    partition = msg.partition(),
                    offset = msg.offset(),
                    "Skipping undecodable station record"
                ),
                Err(e) => tracing::error!(
                    ?e,
                    partition = msg.partition(),
                    offset = msg.offset(),
                    "Failed to write transformed station"
                ),
            }
        }

        tracing::warn!("Stations stream ended, shutting down agent");
    }
}

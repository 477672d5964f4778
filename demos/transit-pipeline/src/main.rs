//! transit-pipeline - runs the transit-stream consumers, producers and stations agent
//! against a Kafka/Redpanda broker and Schema Registry.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser as _;
use tracing_subscriber::EnvFilter;
use transit_stream::{
    create_producer, create_source_consumer, recover_table,
    weather::{WEATHER_KEY_SCHEMA, WEATHER_VALUE_SCHEMA},
    ConsumerOptions, KafkaChangelog, PipelineConfig, ProducerSpec, RecordConsumer,
    RecordProducer, Schema, SchemaRegistryClient, StationAgent, StationTable, Table, TopicProvisioner,
    TopicSpec, Weather, WeatherKey, WeatherReading,
};

#[derive(clap::Parser)]
#[command(version, author, about = "Transit stream pipeline on Kafka")]
pub struct Opts {
    /// TOML config file; every key is optional.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: Option<String>,

    #[arg(long, env = "SCHEMA_REGISTRY_URL")]
    schema_registry_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create the weather, stations and changelog topics if missing.
    Provision,
    /// Run the stations agent, filling the transformed stations table.
    StationsStream,
    /// Consume the weather topic and log the current weather.
    Weather {
        /// Read the topic from the beginning on every assignment.
        #[arg(long)]
        offset_earliest: bool,
    },
    /// Publish one weather reading.
    PublishWeather {
        #[arg(long, default_value_t = 70.0)]
        temperature: f64,

        #[arg(long, default_value = "sunny")]
        status: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("transit_pipeline=info".parse().unwrap())
                .add_directive("transit_stream=info".parse().unwrap())
                .add_directive("rdkafka=warn".parse().unwrap()),
        )
        .init();

    let Opts {
        config: config_path,
        kafka_brokers,
        schema_registry_url,
        command,
    } = Opts::parse();

    let mut config = match config_path {
        Some(path) => match PipelineConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "Error loading config");
                return ExitCode::FAILURE;
            },
        },
        None => PipelineConfig::default(),
    };
    if let Some(brokers) = kafka_brokers {
        config.brokers = brokers;
    }
    if let Some(url) = schema_registry_url {
        config.schema_registry_url = url;
    }

    tracing::info!(
        brokers = %config.brokers,
        schema_registry_url = %config.schema_registry_url,
        "Starting transit-pipeline"
    );

    let result = match command {
        Command::Provision => provision(&config).await,
        Command::StationsStream => run_stations_stream(config).await,
        Command::Weather { offset_earliest } => run_weather(config, offset_earliest).await,
        Command::PublishWeather {
            temperature,
            status,
        } => publish_weather(&config, temperature, status).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        },
    }
}

fn pipeline_topics(config: &PipelineConfig) -> Vec<TopicSpec> {
    vec![
        TopicSpec::new(&config.weather_topic),
        TopicSpec::new(&config.stream.source_topic),
        TopicSpec::compacted(&config.stream.changelog_topic)
            .partitions(config.stream.changelog_partitions),
    ]
}

async fn provision(config: &PipelineConfig) -> transit_stream::Result<()> {
    let provisioner = TopicProvisioner::new(config)?;
    provisioner.ensure_topics(&pipeline_topics(config)).await;
    Ok(())
}

async fn run_stations_stream(config: PipelineConfig) -> transit_stream::Result<()> {
    let provisioner = TopicProvisioner::new(&config)?;
    provisioner
        .ensure_topic(
            &TopicSpec::compacted(&config.stream.changelog_topic)
                .partitions(config.stream.changelog_partitions),
        )
        .await;

    let producer = Arc::new(create_producer(&config)?);
    let changelog = KafkaChangelog::new(producer, &config.stream.changelog_topic);
    let mut table: StationTable<_> = Table::new(&config.stream.table_name, changelog);

    if config.stream.recover_on_start {
        // Changelog replay uses a blocking consumer.
        tokio::task::block_in_place(|| {
            recover_table(&config, &config.stream.changelog_topic, &mut table)
        })?;
    }

    let consumer = create_source_consumer(&config)?;
    let agent = StationAgent::new(table);

    tokio::select! {
        _ = agent.run(consumer) => {},
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received, stopping stations agent"),
    }
    Ok(())
}

async fn run_weather(config: PipelineConfig, offset_earliest: bool) -> transit_stream::Result<()> {
    let options = ConsumerOptions::new(&config.weather_topic, &config.consumer)
        .offset_earliest(offset_earliest || config.consumer.offset_earliest);
    let mut consumer = RecordConsumer::new(&config, options, Weather::new(&config.weather_topic))?;

    tokio::select! {
        _ = consumer.consume() => {},
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received, stopping weather consumer"),
    }

    let weather = consumer.close();
    tracing::info!(
        temperature = weather.temperature,
        status = %weather.status,
        "Last observed weather"
    );
    Ok(())
}

async fn publish_weather(
    config: &PipelineConfig,
    temperature: f64,
    status: String,
) -> transit_stream::Result<()> {
    let provisioner = TopicProvisioner::new(config)?;
    let registry = SchemaRegistryClient::new(&config.schema_registry_url)?;
    if !registry.is_available().await {
        tracing::warn!(url = %registry.base_url(), "Schema Registry not reachable");
    }

    let spec = ProducerSpec::new(&config.weather_topic, Schema::parse_str(WEATHER_KEY_SCHEMA)?)
        .value_schema(Schema::parse_str(WEATHER_VALUE_SCHEMA)?);
    let producer = RecordProducer::new(config, &provisioner, &registry, spec).await?;

    let key = WeatherKey {
        timestamp: RecordProducer::time_millis(),
    };
    let reading = WeatherReading {
        temperature,
        status,
    };
    let (partition, offset) = producer.produce(&key, Some(&reading)).await?;
    tracing::info!(
        topic = producer.topic_name(),
        partition,
        offset,
        temperature = reading.temperature,
        status = %reading.status,
        "Weather published"
    );

    producer.close();
    Ok(())
}

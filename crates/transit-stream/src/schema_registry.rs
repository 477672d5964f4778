//! Schema Registry client for registering and resolving Avro schemas.
//!
//! Uses the Confluent Schema Registry REST API (compatible with Redpanda).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Subject a topic's key schema is registered under.
pub fn key_subject(topic: &str) -> String {
    format!("{topic}-key")
}

/// Subject a topic's value schema is registered under.
pub fn value_subject(topic: &str) -> String {
    format!("{topic}-value")
}

#[derive(Serialize)]
struct RegisterSchemaRequest<'a> {
    #[serde(rename = "schemaType")]
    schema_type: &'a str,
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterSchemaResponse {
    id: u32,
}

#[derive(Deserialize)]
struct SchemaByIdResponse {
    schema: String,
}

#[derive(Deserialize)]
struct SchemaRegistryError {
    error_code: i32,
    message: String,
}

#[derive(Debug, Clone)]
pub struct SchemaRegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl SchemaRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    /// Check if Schema Registry is reachable.
    pub async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/subjects", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Register an Avro schema under `subject`. Registering an identical schema again
    /// returns the existing id.
    pub async fn register(&self, subject: &str, schema: &str) -> Result<u32> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/vnd.schemaregistry.v1+json")
            .json(&RegisterSchemaRequest {
                schema_type: "AVRO",
                schema,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let registered: RegisterSchemaResponse = response.json().await?;
            tracing::debug!(subject, schema_id = registered.id, "Schema registered");
            return Ok(registered.id);
        }

        Err(registry_error(subject, status, response).await)
    }

    /// Fetch the schema text for a schema id.
    pub async fn schema_by_id(&self, id: u32) -> Result<String> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status.is_success() {
            let found: SchemaByIdResponse = response.json().await?;
            return Ok(found.schema);
        }

        Err(registry_error(&format!("schema id {id}"), status, response).await)
    }
}

async fn registry_error(
    subject: &str,
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> Error {
    let body = response.text().await.unwrap_or_default();
    // Registry errors carry a JSON body; anything else (proxies, HTML pages) is kept raw.
    let message = match serde_json::from_str::<SchemaRegistryError>(&body) {
        Ok(err) => format!("code {}: {}", err.error_code, err.message),
        Err(_) if body.is_empty() => "Unknown error".to_string(),
        Err(_) => body,
    };

    Error::SchemaRegistry {
        subject: subject.to_string(),
        status: status.as_u16(),
        message,
    }
}

use std::fmt;

use serde::de::DeserializeOwned;

use crate::error::Result;

/// Key or value of a consumed record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Schema-encoded data, already decoded.
    Decoded(serde_json::Value),
    /// Bytes as they came off the topic.
    Raw(Vec<u8>),
}

impl Payload {
    /// Deserialize the payload. Raw bytes are parsed as JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Decoded(value) => Ok(serde_json::from_value(value.clone())?),
            Self::Raw(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoded(value) => write!(f, "{value}"),
            Self::Raw(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

/// A record handed to a [`MessageHandler`]. Identity is (topic, key, offset).
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Payload>,
    pub value: Option<Payload>,
}

impl fmt::Display for ConsumedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)?;
        if let Some(ref key) = self.key {
            write!(f, " key={key}")?;
        }
        Ok(())
    }
}

/// Callback invoked by the polling consumer for every received record.
pub trait MessageHandler: Send {
    fn handle(&mut self, record: &ConsumedRecord);
}

impl<F> MessageHandler for F
where
    F: FnMut(&ConsumedRecord) + Send,
{
    fn handle(&mut self, record: &ConsumedRecord) { self(record) }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reading {
        temperature: f64,
    }

    #[test]
    fn raw_and_decoded_payloads_deserialize_alike() {
        let raw = Payload::Raw(br#"{"temperature": 55.5}"#.to_vec());
        let decoded = Payload::Decoded(json!({"temperature": 55.5}));

        assert_eq!(raw.deserialize::<Reading>().unwrap(), Reading { temperature: 55.5 });
        assert_eq!(decoded.deserialize::<Reading>().unwrap(), Reading { temperature: 55.5 });
        assert!(Payload::Raw(b"not json".to_vec()).deserialize::<Reading>().is_err());
    }

    #[test]
    fn closures_are_handlers() {
        let mut seen = Vec::new();
        {
            let mut handler = |record: &ConsumedRecord| seen.push(record.offset);
            let record = ConsumedRecord {
                topic: "connect_stations".to_string(),
                partition: 0,
                offset: 7,
                key: Some(Payload::Raw(b"40010".to_vec())),
                value: None,
            };
            assert_eq!(record.to_string(), "connect_stations[0]@7 key=40010");
            handler.handle(&record);
        }
        assert_eq!(seen, vec![7]);
    }
}

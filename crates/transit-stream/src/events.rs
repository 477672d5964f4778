use std::fmt;

use serde::{Deserialize, Serialize};

/// Station record as emitted by the connector on the stations source topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub stop_id: i64,
    pub direction_id: String,
    pub stop_name: String,
    pub station_name: String,
    pub station_descriptive_name: String,
    pub station_id: i64,
    pub order: i32,
    pub red: bool,
    pub blue: bool,
    pub green: bool,
}

/// Train line a station belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Red,
    Blue,
    Green,
    #[default]
    Unknown,
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Table value produced by the stations agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedStation {
    pub station_id: i64,
    pub station_name: String,
    pub order: i32,
    pub line: Line,
}

impl From<&Station> for TransformedStation {
    fn from(station: &Station) -> Self {
        Self {
            station_id: station.station_id,
            station_name: station.station_name.clone(),
            order: station.order,
            line: determine_line(station),
        }
    }
}

/// Red wins over blue, blue over green. A station with no flag set is `Unknown`.
pub fn determine_line(station: &Station) -> Line {
    if station.red {
        Line::Red
    } else if station.blue {
        Line::Blue
    } else if station.green {
        Line::Green
    } else {
        Line::Unknown
    }
}

/// Key of a weather reading: the publish time in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherKey {
    pub timestamp: i64,
}

/// Value published on the weather topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub temperature: f64,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(red: bool, blue: bool, green: bool) -> Station {
        Station {
            stop_id: 30001,
            direction_id: "E".to_string(),
            stop_name: "Austin (O'Hare-bound)".to_string(),
            station_name: "Austin".to_string(),
            station_descriptive_name: "Austin (Blue Line)".to_string(),
            station_id: 40010,
            order: 29,
            red,
            blue,
            green,
        }
    }

    #[test]
    fn single_flag_maps_to_its_line() {
        assert_eq!(determine_line(&station(true, false, false)), Line::Red);
        assert_eq!(determine_line(&station(false, true, false)), Line::Blue);
        assert_eq!(determine_line(&station(false, false, true)), Line::Green);
        assert_eq!(determine_line(&station(false, false, false)), Line::Unknown);
    }

    #[test]
    fn red_takes_precedence_then_blue() {
        assert_eq!(determine_line(&station(true, true, true)), Line::Red);
        assert_eq!(determine_line(&station(true, false, true)), Line::Red);
        assert_eq!(determine_line(&station(false, true, true)), Line::Blue);
    }

    #[test]
    fn transformed_station_copies_identity_fields() {
        let transformed = TransformedStation::from(&station(false, true, false));
        assert_eq!(
            transformed,
            TransformedStation {
                station_id: 40010,
                station_name: "Austin".to_string(),
                order: 29,
                line: Line::Blue,
            }
        );
    }

    #[test]
    fn line_serializes_lowercase() {
        let json = serde_json::to_value(TransformedStation {
            station_id: 1,
            station_name: "Clark/Lake".to_string(),
            order: 3,
            line: Line::Green,
        })
        .unwrap();
        assert_eq!(json["line"], "green");
        assert_eq!(Line::Unknown.to_string(), "unknown");
    }
}

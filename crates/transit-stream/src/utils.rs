use std::{
    fmt::Write,
    time::{SystemTime, UNIX_EPOCH},
};

use rdkafka::TopicPartitionList;

/// Milliseconds since the Unix epoch. Used as the key for time-keyed events.
pub fn time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Format an assignment as `topic[0,1]` for log lines.
pub fn format_partitions(tpl: &TopicPartitionList) -> String {
    let mut out = String::new();
    for (i, elem) in tpl.elements().iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}[{}]", elem.topic(), elem.partition());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_millis_is_after_2020() {
        assert!(time_millis() > 1_577_836_800_000);
    }

    #[test]
    fn formats_each_partition() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("connect_stations", 0);
        tpl.add_partition("connect_stations", 1);
        assert_eq!(format_partitions(&tpl), "connect_stations[0] connect_stations[1]");
    }
}

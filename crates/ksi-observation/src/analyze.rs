//! Analysis over observation history records.

use std::collections::HashMap;

use serde_json::{Value, json};

fn str_of<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

fn is_begin(record: &Value) -> bool {
    str_of(record, "type") == Some("begin")
}

/// Event frequency across begin records, most frequent first.
pub(crate) fn frequency(records: &[Value], limit: usize) -> Value {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for record in records.iter().filter(|r| is_begin(r)) {
        if let Some(event) = str_of(record, "event") {
            let entry = counts.entry(event).or_insert(0);
            *entry = entry.saturating_add(1);
        }
    }
    let mut sorted: Vec<(&str, u64)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    sorted.truncate(limit);
    json!({
        "analysis_type": "frequency",
        "events": sorted
            .into_iter()
            .map(|(event, count)| json!({"event": event, "count": count}))
            .collect::<Vec<_>>(),
    })
}

/// Bigram counts of consecutive begin events per target, most frequent
/// first.
pub(crate) fn sequences(records: &[Value], limit: usize) -> Value {
    let mut last_by_target: HashMap<String, String> = HashMap::new();
    let mut counts: HashMap<(String, String), u64> = HashMap::new();

    for record in records.iter().filter(|r| is_begin(r)) {
        let (Some(target), Some(event)) = (str_of(record, "target"), str_of(record, "event"))
        else {
            continue;
        };
        if let Some(previous) = last_by_target.get(target) {
            let key = (previous.clone(), event.to_string());
            let entry = counts.entry(key).or_insert(0);
            *entry = entry.saturating_add(1);
        }
        last_by_target.insert(target.to_string(), event.to_string());
    }

    let mut sorted: Vec<((String, String), u64)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted.truncate(limit);
    json!({
        "analysis_type": "sequence",
        "sequences": sorted
            .into_iter()
            .map(|((from, to), count)| json!({"sequence": [from, to], "count": count}))
            .collect::<Vec<_>>(),
    })
}

/// Begin/end duration statistics per event name, paired by
/// `observation_id`.
pub(crate) fn performance(records: &[Value]) -> Value {
    let mut begins: HashMap<&str, (&str, i64)> = HashMap::new();
    let mut durations: HashMap<String, Vec<i64>> = HashMap::new();

    for record in records {
        let (Some(id), Some(event), Some(ts)) = (
            str_of(record, "observation_id"),
            str_of(record, "event"),
            record.get("ts_ms").and_then(Value::as_i64),
        ) else {
            continue;
        };
        if is_begin(record) {
            begins.insert(id, (event, ts));
        } else if let Some((begin_event, begin_ts)) = begins.remove(id) {
            if begin_event == event {
                durations
                    .entry(event.to_string())
                    .or_default()
                    .push(ts.saturating_sub(begin_ts));
            }
        }
    }

    let mut events: Vec<Value> = durations
        .into_iter()
        .map(|(event, samples)| {
            let count = i64::try_from(samples.len()).unwrap_or(i64::MAX);
            let total: i64 = samples.iter().fold(0i64, |acc, s| acc.saturating_add(*s));
            let max = samples.iter().copied().max().unwrap_or(0);
            json!({
                "event": event,
                "count": count,
                "avg_ms": total.checked_div(count).unwrap_or(0),
                "max_ms": max,
            })
        })
        .collect();
    events.sort_by(|a, b| {
        b["count"]
            .as_i64()
            .cmp(&a["count"].as_i64())
            .then(a["event"].as_str().cmp(&b["event"].as_str()))
    });
    json!({"analysis_type": "performance", "events": events})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(id: &str, target: &str, event: &str, ts: i64) -> Value {
        json!({"type": "begin", "observation_id": id, "target": target, "event": event, "ts_ms": ts})
    }

    fn end(id: &str, target: &str, event: &str, ts: i64) -> Value {
        json!({"type": "end", "observation_id": id, "target": target, "event": event, "ts_ms": ts})
    }

    #[test]
    fn test_frequency_sorted() {
        let records = vec![
            begin("1", "a", "x:one", 0),
            begin("2", "a", "x:two", 0),
            begin("3", "a", "x:two", 0),
            end("3", "a", "x:two", 1),
        ];
        let result = frequency(&records, 10);
        assert_eq!(result["events"][0]["event"], "x:two");
        assert_eq!(result["events"][0]["count"], 2);
        assert_eq!(result["events"][1]["count"], 1);
    }

    #[test]
    fn test_sequences_bigrams_per_target() {
        let records = vec![
            begin("1", "a", "s:load", 0),
            begin("2", "b", "s:other", 0),
            begin("3", "a", "s:run", 0),
            begin("4", "a", "s:load", 0),
            begin("5", "a", "s:run", 0),
        ];
        let result = sequences(&records, 10);
        assert_eq!(result["sequences"][0]["sequence"], json!(["s:load", "s:run"]));
        assert_eq!(result["sequences"][0]["count"], 2);
    }

    #[test]
    fn test_performance_pairs_durations() {
        let records = vec![
            begin("1", "a", "job:run", 100),
            end("1", "a", "job:run", 150),
            begin("2", "a", "job:run", 200),
            end("2", "a", "job:run", 300),
            begin("3", "a", "job:orphan", 0),
        ];
        let result = performance(&records);
        assert_eq!(result["events"][0]["event"], "job:run");
        assert_eq!(result["events"][0]["count"], 2);
        assert_eq!(result["events"][0]["avg_ms"], 75);
        assert_eq!(result["events"][0]["max_ms"], 100);
    }
}

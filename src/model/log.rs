use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag key prefix for tags that were folded into record contents.
pub const TAG_PREFIX: &str = "__tag__:";

/// One key/value pair of record content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogContent {
    pub key: String,
    pub value: String,
}

/// One log line or event.
///
/// Contents are an unordered set of keys; insertion order is kept only so
/// that output is stable. A zero `time` means "not stamped yet" and is
/// replaced by the process stage before the record reaches an aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ns: Option<u32>,
    pub contents: Vec<LogContent>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time(time: u32) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    /// Append a key without checking for an existing one.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.contents.push(LogContent {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Set a key, replacing the first existing value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.contents.iter_mut().find(|c| c.key == key) {
            Some(content) => content.value = value,
            None => self.contents.push(LogContent { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.contents
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.contents.iter().position(|c| c.key == key)?;
        Some(self.contents.remove(index).value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.contents.iter().any(|c| c.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.contents.iter().map(|c| c.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Stamp the record with `now` if no producer set a timestamp.
    pub fn stamp_if_zero(&mut self, now: SystemTime) {
        if self.time != 0 {
            return;
        }
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        self.time = since_epoch.as_secs() as u32;
        self.time_ns = Some(since_epoch.subsec_nanos());
    }

    /// Approximate wire size: the sum of key and value lengths.
    pub fn size_bytes(&self) -> usize {
        self.contents
            .iter()
            .map(|c| c.key.len() + c.value.len())
            .sum()
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.push(key, value);
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTag {
    pub key: String,
    pub value: String,
}

impl LogTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A homogeneous bundle of records sharing topic, source and tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub topic: String,
    pub source: String,
    pub tags: Vec<LogTag>,
    pub logs: Vec<Record>,
}

impl Batch {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.push(LogTag::new(key, value));
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.logs.iter().map(Record::size_bytes).sum()
    }
}

/// Per-record sidecar carried from an input to the aggregators.
///
/// Aggregators use it to pick the batch a record belongs to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordContext {
    pub source: Option<String>,
    pub topic: Option<String>,
    pub tags: Vec<LogTag>,
    pub hints: BTreeMap<String, String>,
}

impl RecordContext {
    pub fn with_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    /// A key that is equal for records that can share one batch.
    pub fn group_key(&self) -> String {
        let mut key = String::new();
        key.push_str(self.source.as_deref().unwrap_or(""));
        key.push('|');
        key.push_str(self.topic.as_deref().unwrap_or(""));
        for tag in &self.tags {
            key.push('|');
            key.push_str(&tag.key);
            key.push('=');
            key.push_str(&tag.value);
        }
        key
    }
}

/// A record paired with its sidecar, the unit of the input queue.
#[derive(Debug, Clone, Default)]
pub struct RecordWithContext {
    pub record: Record,
    pub context: RecordContext,
}

impl RecordWithContext {
    pub fn new(record: Record, context: RecordContext) -> Self {
        Self { record, context }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_replaces_existing_key() {
        let mut record: Record = [("content", "hello"), ("level", "DEBUG")]
            .into_iter()
            .collect();
        record.set("level", "INFO");
        record.set("host", "a");

        assert_eq!(record.get("level"), Some("INFO"));
        assert_eq!(record.len(), 3);
        assert_eq!(record.keys().collect::<Vec<_>>(), ["content", "level", "host"]);
    }

    #[test]
    fn test_stamp_if_zero() {
        let now = UNIX_EPOCH + Duration::new(1_700_000_000, 42);

        let mut fresh = Record::new();
        fresh.stamp_if_zero(now);
        assert_eq!(fresh.time, 1_700_000_000);
        assert_eq!(fresh.time_ns, Some(42));

        let mut stamped = Record::with_time(7);
        stamped.stamp_if_zero(now);
        assert_eq!(stamped.time, 7);
        assert_eq!(stamped.time_ns, None);
    }

    #[test]
    fn test_group_key_distinguishes_tags() {
        let mut a = RecordContext::with_source("10.0.0.1");
        let b = a.clone();
        a.tags.push(LogTag::new("k", "v"));
        assert_ne!(a.group_key(), b.group_key());
    }

    #[test]
    fn test_batch_size_bytes() {
        let mut batch = Batch::new("topic");
        batch.logs.push([("ab", "cd")].into_iter().collect());
        batch.logs.push([("e", "f")].into_iter().collect());
        assert_eq!(batch.size_bytes(), 6);
        assert_eq!(batch.len(), 2);
    }
}

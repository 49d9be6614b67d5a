use super::log::{Batch, LogTag, Record, RecordContext, TAG_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const META_TOPIC: &str = "__topic__";
pub const META_SOURCE: &str = "__source__";
pub const BODY_KEY: &str = "content";
pub const FILE_OFFSET_KEY: &str = "__file_offset__";

/// Metadata and tags shared by every event of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

impl GroupInfo {
    pub fn topic(&self) -> Option<&str> {
        self.metadata.get(META_TOPIC).map(String::as_str)
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE).map(String::as_str)
    }
}

/// A structured log event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Nanoseconds since the epoch; zero when not stamped yet.
    pub timestamp: u64,
    pub observed_timestamp: u64,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    pub body: String,
    pub tags: BTreeMap<String, String>,
    pub contents: BTreeMap<String, String>,
}

impl Event {
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn stamp_if_zero(&mut self, now: SystemTime) {
        let nanos = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        if self.timestamp == 0 {
            self.timestamp = nanos;
        }
        if self.observed_timestamp == 0 {
            self.observed_timestamp = nanos;
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.body.len()
            + self
                .contents
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Convert a v1 record: `content` becomes the body, `__tag__:` keys
    /// become event tags and `__file_offset__` the offset.
    pub fn from_record(record: Record, now: SystemTime) -> Self {
        let mut event = Event::default();
        if record.time != 0 {
            event.timestamp =
                record.time as u64 * 1_000_000_000 + record.time_ns.unwrap_or(0) as u64;
        }
        for content in record.contents {
            if content.key == BODY_KEY {
                event.body = content.value;
            } else if let Some(tag) = content.key.strip_prefix(TAG_PREFIX) {
                event.tags.insert(tag.to_string(), content.value);
            } else if content.key == FILE_OFFSET_KEY {
                event.offset = content.value.parse().unwrap_or(0);
            } else {
                event.contents.insert(content.key, content.value);
            }
        }
        event.stamp_if_zero(now);
        event
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::with_time((self.timestamp / 1_000_000_000) as u32);
        record.time_ns = Some((self.timestamp % 1_000_000_000) as u32);
        if !self.body.is_empty() {
            record.push(BODY_KEY, self.body.clone());
        }
        for (key, value) in &self.contents {
            record.push(key.clone(), value.clone());
        }
        for (key, value) in &self.tags {
            record.push(format!("{}{}", TAG_PREFIX, key), value.clone());
        }
        record
    }
}

/// The v2 counterpart of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupEvents {
    pub group: GroupInfo,
    pub events: Vec<Event>,
}

impl GroupEvents {
    pub fn new(group: GroupInfo, events: Vec<Event>) -> Self {
        Self { group, events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.events.iter().map(Event::size_bytes).sum()
    }

    /// Build a single-event group from a record and its sidecar.
    pub fn from_record(record: Record, context: &RecordContext, now: SystemTime) -> Self {
        let mut group = GroupInfo::default();
        if let Some(topic) = &context.topic {
            group.metadata.insert(META_TOPIC.to_string(), topic.clone());
        }
        if let Some(source) = &context.source {
            group.metadata.insert(META_SOURCE.to_string(), source.clone());
        }
        for tag in &context.tags {
            group.tags.insert(tag.key.clone(), tag.value.clone());
        }
        Self::new(group, vec![Event::from_record(record, now)])
    }

    pub fn from_batch(batch: Batch, now: SystemTime) -> Self {
        let mut group = GroupInfo::default();
        if !batch.topic.is_empty() {
            group.metadata.insert(META_TOPIC.to_string(), batch.topic);
        }
        if !batch.source.is_empty() {
            group.metadata.insert(META_SOURCE.to_string(), batch.source);
        }
        for tag in batch.tags {
            group.tags.insert(tag.key, tag.value);
        }
        let events = batch
            .logs
            .into_iter()
            .map(|record| Event::from_record(record, now))
            .collect();
        Self::new(group, events)
    }

    pub fn to_batch(&self) -> Batch {
        Batch {
            topic: self.group.topic().unwrap_or_default().to_string(),
            source: self.group.source().unwrap_or_default().to_string(),
            tags: self
                .group
                .tags
                .iter()
                .map(|(k, v)| LogTag::new(k.clone(), v.clone()))
                .collect(),
            logs: self.events.iter().map(Event::to_record).collect(),
        }
    }
}

//! Entry points for records produced outside the pipeline's own inputs.

use super::Pipeline;
use crate::model::{Batch, LogTag, Record, RecordContext, RecordWithContext, BODY_KEY};
use tracing::debug;

pub const LOG_TOPIC_KEY: &str = "__log_topic__";

/// Key prefix for tag parts that carry no key.
pub const DEFAULT_TAG_PREFIX: &str = "__tag__:__prefix__";

const TAG_DELIMITER: &str = "^^^";
const TAG_SEPARATOR: &str = "~=~";

/// Parse `k1~=~v1^^^k2~=~v2`. A part without a key becomes
/// `__tag__:__prefix__N`, where N counts the non-empty parts seen so far.
pub fn parse_tags(raw: &str) -> Vec<LogTag> {
    raw.split(TAG_DELIMITER)
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(index, part)| match part.find(TAG_SEPARATOR) {
            Some(pos) if pos > 0 => {
                LogTag::new(&part[..pos], &part[pos + TAG_SEPARATOR.len()..])
            }
            _ => LogTag::new(format!("{}{}", DEFAULT_TAG_PREFIX, index), part),
        })
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl Pipeline {
    /// Feed one raw line as a record with a single `content` key.
    pub async fn process_raw_log(&self, raw: &[u8], pack_id: &str, topic: &str) {
        debug!(parent: &self.runner.context().span, pack_id, topic, bytes = raw.len(), "process raw log");
        let mut record = Record::new();
        record.push(BODY_KEY, String::from_utf8_lossy(raw));
        let context = RecordContext {
            source: non_empty(pack_id),
            topic: non_empty(topic),
            ..RecordContext::default()
        };
        self.runner
            .receive_raw_log(RecordWithContext::new(record, context))
            .await;
    }

    /// Like [`Pipeline::process_raw_log`], also recording the topic as
    /// `__log_topic__` and attaching `tags`.
    pub async fn process_raw_log_v2(&self, raw: &[u8], pack_id: &str, topic: &str, tags: &str) {
        let mut record = Record::new();
        record.push(BODY_KEY, String::from_utf8_lossy(raw));
        self.process_log(record, pack_id, topic, tags).await;
    }

    /// Feed an already decoded record. Tags go to the record sidecar, or into
    /// the record contents when `UsingOldContentTag` is set.
    pub async fn process_log(&self, mut record: Record, pack_id: &str, topic: &str, tags: &str) {
        if !topic.is_empty() {
            record.push(LOG_TOPIC_KEY, topic);
        }
        let mut context = RecordContext {
            source: non_empty(pack_id),
            topic: non_empty(topic),
            ..RecordContext::default()
        };
        let tags = parse_tags(tags);
        if self.global.using_old_content_tag {
            for tag in tags {
                record.push(tag.key, tag.value);
            }
        } else {
            context.tags = tags;
        }
        self.runner
            .receive_raw_log(RecordWithContext::new(record, context))
            .await;
    }

    /// Feed a whole batch; `pack_id` becomes the source of its records.
    pub async fn process_log_group(&self, batch: Batch, pack_id: &str) {
        self.runner.receive_log_group(batch, pack_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("k1~=~v1^^^bare^^^^^^k2~=~v~=~2");
        assert_eq!(
            tags,
            vec![
                LogTag::new("k1", "v1"),
                LogTag::new("__tag__:__prefix__1", "bare"),
                LogTag::new("k2", "v~=~2"),
            ]
        );
    }

    #[test]
    fn test_leading_separator_is_not_a_key() {
        let tags = parse_tags("~=~value");
        assert_eq!(tags, vec![LogTag::new("__tag__:__prefix__0", "~=~value")]);
        assert!(parse_tags("").is_empty());
    }
}

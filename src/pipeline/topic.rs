use crate::model::Record;
use chrono::{TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    /// Value of a record key.
    Field(String),
    /// strftime pattern applied to the record timestamp.
    Time(String),
}

/// A topic template such as `app-%{service}-%{+yyyyMMdd}`.
///
/// `%{key}` is replaced by the record's value for `key` (empty when the key
/// is missing); `%{+pattern}` formats the record timestamp in UTC using the
/// tokens `yyyy`, `MM`, `dd`, `HH`, `mm` and `ss`.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicFormat {
    segments: Vec<Segment>,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"%\{(\+?)([^}]*)\}").expect("placeholder regex is valid"))
}

/// Translate `yyyyMMdd`-style tokens to a strftime pattern.
fn to_strftime(pattern: &str) -> String {
    const TOKENS: [(&str, &str); 6] = [
        ("yyyy", "%Y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (token, spec) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}

impl TopicFormat {
    pub fn new(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in placeholder().captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let is_time = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            segments.push(if is_time {
                Segment::Time(to_strftime(name))
            } else {
                Segment::Field(name.to_string())
            });
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }
        Self { segments }
    }

    /// True when the template has no placeholders.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn format(&self, record: &Record) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(key) => out.push_str(record.get(key).unwrap_or_default()),
                Segment::Time(pattern) => {
                    if let Some(at) = Utc.timestamp_opt(record.time as i64, 0).single() {
                        out.push_str(&at.format(pattern).to_string());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        // 2023-11-14T22:13:20Z
        let mut record = Record::with_time(1_700_000_000);
        record.push("service", "billing");
        record
    }

    #[test]
    fn test_field_and_date_tokens() {
        let topic = TopicFormat::new("app-%{service}-%{+yyyyMMdd}");
        assert!(!topic.is_static());
        assert_eq!(topic.format(&record()), "app-billing-20231114");
    }

    #[test]
    fn test_time_of_day_tokens() {
        let topic = TopicFormat::new("%{+HH:mm:ss}");
        assert_eq!(topic.format(&record()), "22:13:20");
    }

    #[test]
    fn test_missing_field_is_empty() {
        let topic = TopicFormat::new("x-%{nope}-y");
        assert_eq!(topic.format(&record()), "x--y");
    }

    #[test]
    fn test_static_template() {
        let topic = TopicFormat::new("plain 100%");
        assert!(topic.is_static());
        assert_eq!(topic.format(&Record::new()), "plain 100%");
    }
}

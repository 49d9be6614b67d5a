use crate::model::{Batch, GroupEvents, META_SOURCE};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::OnceLock;

pub const HOSTNAME_TAG: &str = "__hostname__";

/// `|`-separated names of environment variables copied onto every batch.
pub const ENV_TAGS_VAR: &str = "ALIYUN_LOG_ENV_TAGS";

struct HostIdentity {
    ip: String,
    hostname: String,
    env_tags: Vec<(String, String)>,
}

static HOST: OnceLock<HostIdentity> = OnceLock::new();

fn host() -> &'static HostIdentity {
    HOST.get_or_init(|| HostIdentity {
        ip: local_ip().to_string(),
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
        env_tags: load_env_tags(),
    })
}

/// The address the default route would use. Connecting a UDP socket sends
/// nothing on the wire.
fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn load_env_tags() -> Vec<(String, String)> {
    let names = match std::env::var(ENV_TAGS_VAR) {
        Ok(names) => names,
        Err(_) => return Vec::new(),
    };
    names
        .split('|')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| (name.to_string(), std::env::var(name).unwrap_or_default()))
        .collect()
}

/// Tags stamped onto every non-empty batch leaving a pipeline: source IP,
/// hostname, env tags, then the pipeline's global tags.
#[derive(Debug, Clone)]
pub struct BatchTags {
    source_ip: String,
    tags: Vec<(String, String)>,
}

impl BatchTags {
    pub fn new(global_tags: &BTreeMap<String, String>) -> Self {
        let host = host();
        let mut tags = Vec::with_capacity(1 + host.env_tags.len() + global_tags.len());
        tags.push((HOSTNAME_TAG.to_string(), host.hostname.clone()));
        tags.extend(host.env_tags.iter().cloned());
        tags.extend(global_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            source_ip: host.ip.clone(),
            tags,
        }
    }

    pub fn source_ip(&self) -> &str {
        &self.source_ip
    }

    pub fn stamp_batch(&self, batch: &mut Batch) {
        batch.source = self.source_ip.clone();
        for (key, value) in &self.tags {
            batch.add_tag(key.clone(), value.clone());
        }
    }

    pub fn stamp_group(&self, group: &mut GroupEvents) {
        group
            .group
            .metadata
            .insert(META_SOURCE.to_string(), self.source_ip.clone());
        for (key, value) in &self.tags {
            group.group.tags.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_batch_adds_hostname_and_global_tags() {
        let mut global = BTreeMap::new();
        global.insert("dc".to_string(), "east".to_string());
        let tags = BatchTags::new(&global);

        let mut batch = Batch::default();
        tags.stamp_batch(&mut batch);

        assert!(!batch.source.is_empty());
        assert!(batch.tag(HOSTNAME_TAG).is_some());
        assert_eq!(batch.tag("dc"), Some("east"));
    }

    #[test]
    fn test_stamp_group_sets_source_metadata() {
        let tags = BatchTags::new(&BTreeMap::new());
        let mut group = GroupEvents::default();
        tags.stamp_group(&mut group);
        assert_eq!(group.group.source(), Some(tags.source_ip()));
        assert!(group.group.tags.contains_key(HOSTNAME_TAG));
    }
}

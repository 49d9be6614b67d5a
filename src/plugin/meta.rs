use std::sync::atomic::{AtomicI32, Ordering};

// Type names follow `pluginType[/instanceName]/pluginID#priority`.

/// Text before the first `/` (priority suffix removed).
pub fn plugin_type(type_with_id: &str) -> &str {
    let name = strip_priority(type_with_id);
    match name.find('/') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Text before the last `/`; extensions are looked up by this key.
pub fn plugin_type_and_name(type_with_id: &str) -> &str {
    let name = strip_priority(type_with_id);
    match name.rfind('/') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Text after the last `/`, empty when there is none.
pub fn plugin_id(type_with_id: &str) -> &str {
    let name = strip_priority(type_with_id);
    match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => "",
    }
}

pub fn has_plugin_id(type_with_id: &str) -> bool {
    strip_priority(type_with_id).contains('/')
}

/// Integer after `#`; 0 when absent or malformed.
pub fn plugin_priority(type_with_id: &str) -> i32 {
    type_with_id
        .find('#')
        .and_then(|idx| type_with_id[idx + 1..].parse().ok())
        .unwrap_or(0)
}

fn strip_priority(type_with_id: &str) -> &str {
    match type_with_id.find('#') {
        Some(idx) => &type_with_id[..idx],
        None => type_with_id,
    }
}

/// Identity of one plugin instance inside a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginMeta {
    pub plugin_type_with_id: String,
    pub plugin_type: String,
    pub plugin_id: String,
    pub priority: i32,
    pub node_id: String,
    pub child_node_id: String,
}

impl PluginMeta {
    /// Extension lookup key (`type[/name]`).
    pub fn type_and_name(&self) -> &str {
        plugin_type_and_name(&self.plugin_type_with_id)
    }
}

/// Per-pipeline sequential plugin and node id source.
#[derive(Debug, Default)]
pub struct PluginIdGenerator {
    plugin_id: AtomicI32,
    node_id: AtomicI32,
}

impl PluginIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_plugin_id(&self) -> String {
        (self.plugin_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn next_node_id(&self, last_one: bool) -> (String, String) {
        let id = self.node_id.fetch_add(1, Ordering::SeqCst) + 1;
        if last_one {
            (id.to_string(), "-1".to_string())
        } else {
            (id.to_string(), (id + 1).to_string())
        }
    }

    /// Build the metadata for a configured type string.
    ///
    /// A numeric explicit id moves the sequence so later generated ids do not
    /// collide with it. Extensions pass `gen_node_id = false`.
    pub fn gen_plugin_meta(&self, type_with_id: &str, gen_node_id: bool, last_one: bool) -> PluginMeta {
        let priority = plugin_priority(type_with_id);
        let name = strip_priority(type_with_id);
        let (node_id, child_node_id) = if gen_node_id {
            self.next_node_id(last_one)
        } else {
            (String::new(), String::new())
        };

        if has_plugin_id(name) {
            let id = plugin_id(name);
            if let Ok(numeric) = id.parse::<i32>() {
                self.plugin_id.store(numeric, Ordering::SeqCst);
            }
            return PluginMeta {
                plugin_type_with_id: name.to_string(),
                plugin_type: plugin_type(name).to_string(),
                plugin_id: id.to_string(),
                priority,
                node_id,
                child_node_id,
            };
        }

        let id = self.next_plugin_id();
        PluginMeta {
            plugin_type_with_id: format!("{}/{}", name, id),
            plugin_type: name.to_string(),
            plugin_id: id,
            priority,
            node_id,
            child_node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_grammar() {
        let s = "ext_basic_auth/shared/7#3";
        assert_eq!(plugin_type(s), "ext_basic_auth");
        assert_eq!(plugin_type_and_name(s), "ext_basic_auth/shared");
        assert_eq!(plugin_id(s), "7");
        assert_eq!(plugin_priority(s), 3);

        assert_eq!(plugin_type("processor_regex"), "processor_regex");
        assert_eq!(plugin_id("processor_regex"), "");
        assert_eq!(plugin_priority("processor_regex#x"), 0);
    }

    #[test]
    fn test_generated_ids_are_sequential() {
        let ids = PluginIdGenerator::new();
        let a = ids.gen_plugin_meta("service_mock", true, false);
        let b = ids.gen_plugin_meta("processor_regex#2", true, false);

        assert_eq!(a.plugin_type_with_id, "service_mock/1");
        assert_eq!(a.node_id, "1");
        assert_eq!(a.child_node_id, "2");
        assert_eq!(b.plugin_type_with_id, "processor_regex/2");
        assert_eq!(b.plugin_type, "processor_regex");
        assert_eq!(b.priority, 2);
    }

    #[test]
    fn test_explicit_id_moves_sequence() {
        let ids = PluginIdGenerator::new();
        let explicit = ids.gen_plugin_meta("flusher_http/10", true, true);
        let next = ids.gen_plugin_meta("flusher_stdout", false, false);

        assert_eq!(explicit.plugin_id, "10");
        assert_eq!(explicit.child_node_id, "-1");
        assert_eq!(next.plugin_id, "11");
        assert!(next.node_id.is_empty());
    }
}

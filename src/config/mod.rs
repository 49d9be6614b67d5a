pub mod generate;
pub mod parse;
pub mod types;
pub mod version;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, parse_config, ConfigError};
pub use types::{
    AgentConfig, CheckpointSettings, ControlSettings, GlobalConfig, PipelinesSettings,
    RuntimeSettings,
};
pub use version::detail_hash;

/// Forces `AlwaysOnline` for pipelines reading container stdout.
pub const ALWAYS_ONLINE_FOR_STDOUT_ENV: &str = "ALIYUN_LOGTAIL_ENABLE_ALWAYS_ONLINE_FOR_STDOUT";

const SYSTEM_CONFIG: &str = "/etc/logferry/config.yml";

fn env_reference() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env reference pattern")
    })
}

/// Replace every `$env{NAME}` whose variable is set. Unset references stay.
pub fn expand_env_vars(text: &str) -> String {
    env_reference()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Names of the `$env{NAME}` references left in `text`, sorted and deduplicated.
pub fn unset_env_refs(text: &str) -> Vec<String> {
    let mut names: Vec<String> = env_reference()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// `~` and `~/rest` resolve against the home directory when one is known.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) if rest.as_os_str().is_empty() => home,
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Where the agent looks for its config when `--config` is not given.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(2);
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/logferry/config.yml"));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}

/// The explicit path (tilde-expanded), else the first default that exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(expand_tilde(path)),
        None => default_config_paths().into_iter().find(|p| p.exists()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("LOGFERRY_TEST_DIR", "/data");
        std::env::set_var("LOGFERRY_TEST_FILE", "ckpt");
        assert_eq!(
            expand_env_vars("$env{LOGFERRY_TEST_DIR}/$env{LOGFERRY_TEST_FILE}"),
            "/data/ckpt"
        );
        assert_eq!(
            expand_env_vars("$env{LOGFERRY_TEST_DIR}/$env{LOGFERRY_TEST_UNSET}"),
            "/data/$env{LOGFERRY_TEST_UNSET}"
        );
        // Topic templates share the brace syntax but not the prefix.
        assert_eq!(expand_env_vars("%{host}-%{+yyyyMMdd}"), "%{host}-%{+yyyyMMdd}");
        std::env::remove_var("LOGFERRY_TEST_DIR");
        std::env::remove_var("LOGFERRY_TEST_FILE");
    }

    #[test]
    fn test_unset_env_refs() {
        let text = "a: $env{ZZ_UNSET_B}\nb: $env{ZZ_UNSET_A}\nc: $env{ZZ_UNSET_B}";
        assert_eq!(unset_env_refs(text), vec!["ZZ_UNSET_A", "ZZ_UNSET_B"]);
        assert!(unset_env_refs("plain").is_empty());
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/abs/path")), Path::new("/abs/path"));
        assert_eq!(expand_tilde(Path::new("rel/path")), Path::new("rel/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~")), home);
            assert_eq!(expand_tilde(Path::new("~/x/y")), home.join("x/y"));
        }
    }

    #[test]
    fn test_explicit_config_path_wins() {
        assert_eq!(
            resolve_config_path(Some(Path::new("/tmp/agent.yml"))),
            Some(PathBuf::from("/tmp/agent.yml"))
        );
        assert_eq!(default_config_paths().last(), Some(&PathBuf::from(SYSTEM_CONFIG)));
    }
}

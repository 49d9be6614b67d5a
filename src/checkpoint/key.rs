use super::{CheckpointError, Result};

pub const KEY_SEPARATOR: char = '^';

/// Build the store-level key for a pipeline's user key.
///
/// User keys may not contain the separator, so the last `^` of a composite
/// key always marks the end of the pipeline name.
pub fn composite_key(pipeline: &str, user_key: &str) -> Result<String> {
    if user_key.contains(KEY_SEPARATOR) {
        return Err(CheckpointError::InvalidKey(user_key.to_string()));
    }
    Ok(format!("{}{}{}", pipeline, KEY_SEPARATOR, user_key))
}

/// Split a composite key into `(pipeline, user_key)`.
///
/// Returns `None` for keys without a separator or with an empty pipeline
/// name; the sweeper treats those as garbage.
pub fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    let index = key.rfind(KEY_SEPARATOR)?;
    let (pipeline, rest) = key.split_at(index);
    if pipeline.is_empty() {
        return None;
    }
    Some((pipeline, &rest[KEY_SEPARATOR.len_utf8()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key() {
        assert_eq!(composite_key("nginx", "offset").unwrap(), "nginx^offset");
        assert!(matches!(
            composite_key("nginx", "a^b"),
            Err(CheckpointError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_split_uses_last_separator() {
        assert_eq!(split_composite_key("a^b^c"), Some(("a^b", "c")));
        assert_eq!(split_composite_key("nginx^"), Some(("nginx", "")));
        assert_eq!(split_composite_key("no-separator"), None);
        assert_eq!(split_composite_key("^orphan"), None);
    }
}

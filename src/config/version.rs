use sha2::{Digest, Sha256};

/// Stable identity of a pipeline document: lowercase hex SHA-256 of its text.
///
/// Two loads of the same name compare detail hashes to decide whether a
/// cached or still-stopping instance is the same configuration.
pub fn detail_hash(document: &str) -> String {
    let digest = Sha256::digest(document.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

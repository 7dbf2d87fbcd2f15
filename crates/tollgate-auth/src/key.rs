use sha2::{Digest, Sha256};

/// Length of the random part after `<prefix>-`
pub const SUFFIX_LEN: usize = 48;

/// Check that `raw` is `<prefix>-` followed by [`SUFFIX_LEN`] ASCII
/// alphanumerics
pub fn has_valid_shape(prefix: &str, raw: &str) -> bool {
    let Some(suffix) = raw.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('-')) else {
        return false;
    };

    suffix.len() == SUFFIX_LEN && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Hex SHA-256 of the full key text, the form keys are stored and cached under
pub fn hash_key(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prefix: &str, suffix_len: usize) -> String {
        format!("{prefix}-{}", "a1B2".repeat(12).chars().take(suffix_len).collect::<String>())
    }

    #[test]
    fn accepts_prefix_and_full_suffix() {
        assert!(has_valid_shape("sk", &key("sk", 48)));
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(!has_valid_shape("sk", &key("pk", 48)));
        assert!(!has_valid_shape("sk", &key("sk", 47)));
        assert!(!has_valid_shape("sk", &format!("{}x", key("sk", 48))));
        assert!(!has_valid_shape("sk", &format!("sk_{}", "a".repeat(48))));
        assert!(!has_valid_shape("sk", &format!("sk-{}!", "a".repeat(47))));
        assert!(!has_valid_shape("sk", ""));
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let hash = hash_key("abc");
        assert_eq!(hash, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}

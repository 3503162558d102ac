use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Random bytes per issued secret (hex-encoded after the prefix).
const SECRET_BYTES: usize = 32;

/// Generate a fresh bearer secret: `<prefix><64 hex chars>`.
pub fn generate_secret(prefix: &str) -> Zeroizing<String> {
    let mut random_bytes = Zeroizing::new([0u8; SECRET_BYTES]);
    OsRng.fill_bytes(random_bytes.as_mut_slice());
    Zeroizing::new(format!("{}{}", prefix, hex::encode(random_bytes.as_slice())))
}

/// Cheap syntactic gate run before any hashing or store access.
pub fn has_valid_format(secret: &str, prefix: &str) -> bool {
    secret.len() > prefix.len() && secret.starts_with(prefix)
}

/// First characters of a secret, safe for logs.
pub fn mask(secret: &str) -> String {
    if secret.len() > 10 && secret.is_char_boundary(8) {
        format!("{}…", &secret[..8])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret("sk-");
        assert!(secret.starts_with("sk-"));
        assert_eq!(secret.len(), 3 + SECRET_BYTES * 2);
        assert!(secret[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_secrets_differ() {
        assert_ne!(*generate_secret("sk-"), *generate_secret("sk-"));
    }

    #[test]
    fn test_format_gate() {
        assert!(has_valid_format("sk-abc", "sk-"));
        assert!(!has_valid_format("sk-", "sk-"));
        assert!(!has_valid_format("not-the-right-prefix", "sk-"));
        assert!(!has_valid_format("", "sk-"));
    }

    #[test]
    fn test_mask_hides_tail() {
        let masked = mask("sk-0123456789abcdef");
        assert_eq!(masked, "sk-01234…");
        assert_eq!(mask("short"), "****");
    }
}

use sha2::{Digest, Sha256};

/// Normalize a claim for comparison: lowercase, strip punctuation, collapse
/// whitespace. Two claims that differ only in phrasing noise normalize to
/// the same string.
pub fn normalize_claim(claim: &str) -> String {
    let mut out = String::with_capacity(claim.len());
    let mut last_was_space = true;
    for ch in claim.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Stable fingerprint of a normalized claim, used for deadlock detection
/// and pattern matching.
pub fn claim_fingerprint(claim: &str) -> String {
    let normalized = normalize_claim(claim);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_noise() {
        assert_eq!(
            normalize_claim("  Missing error-handling, in parse()!  "),
            "missing error handling in parse"
        );
    }

    #[test]
    fn equivalent_phrasings_share_a_fingerprint() {
        assert_eq!(
            claim_fingerprint("Missing error handling in parse."),
            claim_fingerprint("missing ERROR-handling in parse")
        );
    }

    #[test]
    fn different_claims_differ() {
        assert_ne!(
            claim_fingerprint("missing error handling"),
            claim_fingerprint("missing tests")
        );
    }
}

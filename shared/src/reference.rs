use rand::Rng;

pub const REFERENCE_PREFIX: &str = "GO-";
const REFERENCE_LEN: usize = 10;
// Crockford base32: no I, L, O or U, so references survive being read aloud.
const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Random guest-facing order reference, e.g. `GO-7M2K9QXH4B`.
pub fn generate_order_reference() -> String {
    let mut rng = rand::thread_rng();
    let body: String = (0..REFERENCE_LEN)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect();
    format!("{REFERENCE_PREFIX}{body}")
}

pub fn is_well_formed(reference: &str) -> bool {
    reference
        .strip_prefix(REFERENCE_PREFIX)
        .map(|body| body.len() == REFERENCE_LEN && body.bytes().all(|b| ALPHABET.contains(&b)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_references_are_well_formed_and_distinct() {
        let refs: HashSet<String> = (0..1000).map(|_| generate_order_reference()).collect();
        assert_eq!(refs.len(), 1000);
        assert!(refs.iter().all(|r| is_well_formed(r)));
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(!is_well_formed("GO-123"));
        assert!(!is_well_formed("XX-7M2K9QXH4B"));
        assert!(!is_well_formed("GO-7M2K9QXH4I"));
    }
}

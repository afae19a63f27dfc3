//! Content hashing and canonical body JSON
//!
//! The content hash is SHA-256 over a canonical JSON rendering of the
//! body-relevant fields `{title, text, code, type, language}` with keys in
//! lexicographic order and absent optional fields rendered as empty strings.
//! Scope and timestamps are excluded on purpose: identical content stored in
//! two scopes hashes identically and deduplicates.

use sha2::{Digest, Sha256};

use crate::types::MemoryBody;

/// SHA-256 digest as a 32-byte array
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 digest as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Canonical JSON for hashing: sorted keys, no optional omissions
///
/// Keys appear in lexicographic order (code, language, text, title, type)
/// and `None` body fields render as `""`, so the rendering is a pure
/// function of the body content.
pub fn canonical_body_json(body: &MemoryBody) -> String {
    let mut map = serde_json::Map::new();
    map.insert(
        "code".into(),
        serde_json::Value::String(body.code.clone().unwrap_or_default()),
    );
    map.insert(
        "language".into(),
        serde_json::Value::String(body.language.clone().unwrap_or_default()),
    );
    map.insert(
        "text".into(),
        serde_json::Value::String(body.text.clone().unwrap_or_default()),
    );
    map.insert(
        "title".into(),
        serde_json::Value::String(body.title.clone().unwrap_or_default()),
    );
    map.insert(
        "type".into(),
        serde_json::Value::String(body.kind.as_str().to_string()),
    );
    // serde_json::Map preserves insertion order, which is already sorted here
    serde_json::Value::Object(map).to_string()
}

/// Content hash of a body: SHA-256 of its canonical JSON, lowercase hex
pub fn content_hash(body: &MemoryBody) -> String {
    sha256_hex(canonical_body_json(body).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    fn body(title: &str, text: &str, code: &str, lang: &str) -> MemoryBody {
        MemoryBody {
            title: Some(title.to_string()).filter(|s| !s.is_empty()),
            text: Some(text.to_string()).filter(|s| !s.is_empty()),
            code: Some(code.to_string()).filter(|s| !s.is_empty()),
            kind: MemoryType::Snippet,
            language: Some(lang.to_string()).filter(|s| !s.is_empty()),
        }
    }

    #[test]
    fn test_canonical_json_key_order() {
        let json = canonical_body_json(&body("Debounce", "", "function debounce(f,w){}", "js"));
        assert_eq!(
            json,
            r#"{"code":"function debounce(f,w){}","language":"js","text":"","title":"Debounce","type":"snippet"}"#
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = content_hash(&body("T", "x", "y", "rs"));
        let b = content_hash(&body("T", "x", "y", "rs"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_ignores_missing_vs_empty() {
        // None and Some("") canonicalize identically
        let explicit = MemoryBody {
            title: Some("T".into()),
            text: Some(String::new()),
            code: None,
            kind: MemoryType::Snippet,
            language: None,
        };
        let sparse = MemoryBody {
            title: Some("T".into()),
            text: None,
            code: None,
            kind: MemoryType::Snippet,
            language: None,
        };
        assert_eq!(content_hash(&explicit), content_hash(&sparse));
    }

    #[test]
    fn test_hash_distinguishes_content() {
        assert_ne!(
            content_hash(&body("A", "", "x", "js")),
            content_hash(&body("B", "", "x", "js"))
        );
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

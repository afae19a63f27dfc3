//! Text tokenization for indexing and querying
//!
//! Splits on camel-case boundaries and non-alphanumeric characters, then
//! lowercases. `getUserById` tokenizes to `[get, user, by, id]` minus the
//! short-token filter, so code identifiers and prose share one index.

/// Tokenize text into searchable terms
///
/// - Split on any non-alphanumeric character
/// - Split camelCase boundaries (`fooBar` -> `foo`, `bar`) and
///   acronym-to-word transitions (`HTTPServer` -> `http`, `server`)
/// - Lowercase everything
/// - Filter tokens shorter than 2 characters
///
/// Total and order-preserving: never fails, and token order follows input
/// order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        split_camel(raw, &mut tokens);
    }
    tokens.retain(|t| t.len() >= 2);
    tokens
}

/// Tokenize and deduplicate, preserving first-seen order (query processing)
pub fn tokenize_unique(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn split_camel(word: &str, out: &mut Vec<String>) {
    let chars: Vec<char> = word.chars().collect();
    let mut start = 0;
    for i in 1..chars.len() {
        let prev = chars[i - 1];
        let cur = chars[i];
        let next_lower = chars.get(i + 1).map(|c| c.is_lowercase()).unwrap_or(false);
        // lower->Upper is always a boundary; UPPER->Upper+lower ends an acronym
        let boundary = (prev.is_lowercase() && cur.is_uppercase())
            || (prev.is_uppercase() && cur.is_uppercase() && next_lower);
        if boundary {
            out.push(chars[start..i].iter().collect::<String>().to_lowercase());
            start = i;
        }
    }
    out.push(chars[start..].iter().collect::<String>().to_lowercase());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tokenize_basic() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
    }

    #[test]
    fn test_tokenize_camel_case() {
        assert_eq!(tokenize("getUserById"), vec!["get", "user", "by", "id"]);
        assert_eq!(tokenize("debounceFn"), vec!["debounce", "fn"]);
    }

    #[test]
    fn test_tokenize_acronym_boundary() {
        assert_eq!(tokenize("HTTPServer"), vec!["http", "server"]);
        assert_eq!(tokenize("parseJSONBody"), vec!["parse", "json", "body"]);
    }

    #[test]
    fn test_tokenize_filters_short() {
        assert_eq!(tokenize("I am a test"), vec!["am", "test"]);
    }

    #[test]
    fn test_tokenize_numbers_kept() {
        assert_eq!(tokenize("utf8 sha256"), vec!["utf8", "sha256"]);
    }

    #[test]
    fn test_tokenize_empty_and_punctuation() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("...---...").is_empty());
    }

    #[test]
    fn test_tokenize_unique_preserves_order() {
        assert_eq!(
            tokenize_unique("apple banana apple cherry"),
            vec!["apple", "banana", "cherry"]
        );
    }

    proptest! {
        #[test]
        fn test_tokenize_is_total(s in ".*") {
            // Never panics, always lowercase, never short tokens
            for token in tokenize(&s) {
                prop_assert!(token.len() >= 2);
                prop_assert_eq!(token.to_lowercase(), token.clone());
            }
        }

        #[test]
        fn test_tokenize_idempotent_on_joined_output(s in "[a-zA-Z0-9 ]{0,64}") {
            let first = tokenize(&s);
            let rejoined = first.join(" ");
            prop_assert_eq!(tokenize(&rejoined), first);
        }
    }
}

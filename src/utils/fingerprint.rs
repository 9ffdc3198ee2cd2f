//! Stable digests used as memoization and singleflight keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash an arbitrary string, whitespace-normalized, to a hex digest.
pub fn digest(text: &str) -> String {
    let mut h = DefaultHasher::new();
    text.split_whitespace().collect::<Vec<_>>().join(" ").hash(&mut h);
    format!("{:x}", h.finish())
}

/// Fingerprint for a schema-agent lookup: datasource plus question digest.
pub fn schema_key(datasource_id: &str, question: Option<&str>) -> String {
    format!("schema:{}:{}", datasource_id, digest(question.unwrap_or("")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_normalizes_whitespace() {
        assert_eq!(digest("select  1"), digest("select 1"));
        assert_ne!(digest("select 1"), digest("select 2"));
    }

    #[test]
    fn schema_key_distinguishes_questions() {
        let a = schema_key("ds1", Some("revenue by product"));
        let b = schema_key("ds1", Some("orders by region"));
        assert_ne!(a, b);
        assert_eq!(schema_key("ds1", None), schema_key("ds1", Some("")));
    }
}

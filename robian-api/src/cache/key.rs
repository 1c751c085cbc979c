//! Cache key construction.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::CacheNamespace;

/// Keys longer than this are shortened with a hash suffix.
const MAX_KEY_LEN: usize = 200;
/// Number of id characters kept in a shortened key.
const SHORT_ID_CHARS: usize = 50;

/// Fully qualified cache key, `"{namespace}:{id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: CacheNamespace,
    key: String,
}

impl CacheKey {
    pub fn new(namespace: CacheNamespace, id: &str) -> Self {
        Self::build(namespace, id, format!("{}:{}", namespace.as_str(), id))
    }

    /// Key for a parameterised lookup, e.g. a filtered listing.
    ///
    /// Parameters are rendered as JSON; `serde_json` keeps map keys sorted,
    /// so equal parameter sets always produce the same key.
    pub fn with_params<P: Serialize>(
        namespace: CacheNamespace,
        id: &str,
        params: &P,
    ) -> serde_json::Result<Self> {
        let value = serde_json::to_value(params)?;
        let rendered = serde_json::to_string(&value)?;
        Ok(Self::build(
            namespace,
            id,
            format!("{}:{}:{}", namespace.as_str(), id, rendered),
        ))
    }

    fn build(namespace: CacheNamespace, id: &str, full: String) -> Self {
        if full.len() <= MAX_KEY_LEN {
            return Self {
                namespace,
                key: full,
            };
        }

        let digest = Sha256::digest(full.as_bytes());
        let suffix = &hex::encode(digest)[..8];
        let short_id: String = id.chars().take(SHORT_ID_CHARS).collect();
        Self {
            namespace,
            key: format!("{}:{}...{}", namespace.as_str(), short_id, suffix),
        }
    }

    pub fn namespace(&self) -> CacheNamespace {
        self.namespace
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

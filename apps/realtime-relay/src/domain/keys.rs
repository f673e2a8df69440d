//! Cache Key Namespacing
//!
//! Keys are namespaced per entity kind (`price:0xabc`, `pair:0xdef`) and each
//! kind carries a default TTL class.

use std::time::Duration;

/// TTL class for cached entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Fast-moving data (prices, reserves).
    Short,
    /// Aggregates recomputed every few minutes.
    Medium,
    /// Slow-moving metadata.
    Long,
}

impl TtlClass {
    /// Duration for this class.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Short => Duration::from_secs(60),
            Self::Medium => Duration::from_secs(5 * 60),
            Self::Long => Duration::from_secs(30 * 60),
        }
    }
}

/// Kind of cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Token metadata.
    Token,
    /// Liquidity pair.
    Pair,
    /// Oracle price.
    Price,
    /// Pair reserves.
    Reserve,
    /// Protocol metrics snapshot.
    Metrics,
    /// Indexed transaction.
    Transaction,
}

impl EntityKind {
    /// Key prefix without the trailing separator.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Pair => "pair",
            Self::Price => "price",
            Self::Reserve => "reserve",
            Self::Metrics => "metrics",
            Self::Transaction => "transaction",
        }
    }

    /// Default TTL class.
    #[must_use]
    pub const fn ttl_class(self) -> TtlClass {
        match self {
            Self::Price | Self::Reserve => TtlClass::Short,
            Self::Pair | Self::Metrics => TtlClass::Medium,
            Self::Token | Self::Transaction => TtlClass::Long,
        }
    }

    /// Default TTL.
    #[must_use]
    pub const fn default_ttl(self) -> Duration {
        self.ttl_class().duration()
    }
}

/// A namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: EntityKind,
    key: String,
}

impl CacheKey {
    /// Build a key for an entity id.
    #[must_use]
    pub fn new(kind: EntityKind, id: &str) -> Self {
        Self {
            kind,
            key: format!("{}:{}", kind.prefix(), id.to_lowercase()),
        }
    }

    /// Entity kind.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Full key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_lowercased() {
        let key = CacheKey::new(EntityKind::Price, "0xABC");
        assert_eq!(key.as_str(), "price:0xabc");
        assert_eq!(key.kind(), EntityKind::Price);
    }

    #[test]
    fn ttl_classes() {
        assert_eq!(EntityKind::Price.default_ttl(), Duration::from_secs(60));
        assert_eq!(EntityKind::Pair.default_ttl(), Duration::from_secs(300));
        assert_eq!(EntityKind::Token.default_ttl(), Duration::from_secs(1800));
    }
}

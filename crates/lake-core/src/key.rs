//! Natural keys and their deterministic surrogate keys.
//!
//! A [`NaturalKey`] identifies an entity in its source domain (an IP address,
//! a public key, a circuit code). A [`SurrogateKey`] is derived from it and is
//! stored as `entity_id` in every history table:
//!
//! - **Stable**: the same natural key always yields the same surrogate key
//! - **Lookup-free**: a pure function of the natural key bytes
//! - **Unambiguous**: parts are length-prefixed before hashing, so
//!   `["a|b"]` and `["a", "b"]` never collide by concatenation
//!
//! # Example
//!
//! ```rust
//! use lake_core::key::{NaturalKey, SurrogateKey};
//!
//! let key = NaturalKey::new(["circuit-a", "42"]).unwrap();
//! let id = SurrogateKey::from_natural(&key);
//! assert_eq!(id.as_str().len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// One or more strings identifying a dimension entity in its source domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    /// Builds a natural key from its parts.
    ///
    /// Each part is trimmed of surrounding whitespace; case is preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no parts or every part is empty.
    pub fn new<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = parts
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .collect();
        if parts.is_empty() || parts.iter().all(String::is_empty) {
            return Err(Error::InvalidInput(
                "natural key must have at least one non-empty part".into(),
            ));
        }
        Ok(Self(parts))
    }

    /// Builds a single-part natural key.
    ///
    /// # Errors
    ///
    /// Returns an error if the part is empty after trimming.
    pub fn single(part: impl AsRef<str>) -> Result<Self> {
        Self::new([part])
    }

    /// Returns the normalized parts.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Deterministic identifier derived from a [`NaturalKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(String);

impl SurrogateKey {
    /// Derives the surrogate key for a natural key.
    #[must_use]
    pub fn from_natural(key: &NaturalKey) -> Self {
        let mut hasher = Sha256::new();
        for part in key.parts() {
            hasher.update(part.len().to_string().as_bytes());
            hasher.update(b":");
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Normalizes the parts into a natural key and derives its surrogate key.
    ///
    /// # Errors
    ///
    /// Returns an error if the parts do not form a valid natural key.
    pub fn derive<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        NaturalKey::new(parts).map(|key| Self::from_natural(&key))
    }

    /// Wraps an already-derived identifier read back from the store.
    #[must_use]
    pub fn from_stored(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let a = SurrogateKey::derive(["7Np41oeYqPefeNQEHSv1UDhYrehxin3NStELsSKCT4K2"]).unwrap();
        let b = SurrogateKey::derive(["7Np41oeYqPefeNQEHSv1UDhYrehxin3NStELsSKCT4K2"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn whitespace_is_normalized_case_is_not() {
        let a = SurrogateKey::derive([" abc "]).unwrap();
        let b = SurrogateKey::derive(["abc"]).unwrap();
        let c = SurrogateKey::derive(["ABC"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn composite_parts_are_unambiguous() {
        let joined = SurrogateKey::derive(["a:b"]).unwrap();
        let split = SurrogateKey::derive(["a", "b"]).unwrap();
        let shifted = SurrogateKey::derive(["a:", "b"]).unwrap();
        assert_ne!(joined, split);
        assert_ne!(split, shifted);
    }

    #[test]
    fn distinct_keys_yield_distinct_ids() {
        let ids: std::collections::HashSet<_> = (0..1000)
            .map(|i| SurrogateKey::derive([format!("10.0.{}.{}", i / 256, i % 256)]).unwrap())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn empty_keys_are_rejected() {
        assert!(NaturalKey::new(Vec::<String>::new()).is_err());
        assert!(NaturalKey::new(["  ", ""]).is_err());
        assert!(NaturalKey::new(["", "x"]).is_ok());
    }
}

//! Identifier pseudonymisation
//!
//! Beneficiary identifiers (MBIs, HICNs) never reach a sink in the clear. They
//! are replaced by a PBKDF2-HMAC-SHA256 digest keyed with a secret pepper, so
//! the same identifier hashes identically in every run and on every host that
//! shares the pepper. The derivation is deliberately slow, which is why
//! [`CachedIdHasher`] keeps recent results in a size-bounded cache.

use crate::error::{BfdError, Result};
use moka::sync::Cache;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Derived key length in bytes; rendered as 64 hex characters.
pub const HASH_BYTES: usize = 32;

/// A deterministic one-way identifier hash.
pub trait IdentifierHash: Send + Sync {
    fn compute(&self, identifier: &str) -> Result<String>;
}

/// PBKDF2-HMAC-SHA256 with the pepper as salt
#[derive(Clone)]
pub struct IdHasher {
    pepper: Arc<[u8]>,
    iterations: u32,
}

impl IdHasher {
    pub fn new(pepper: impl Into<Vec<u8>>, iterations: u32) -> Result<Self> {
        let pepper: Vec<u8> = pepper.into();
        if pepper.is_empty() {
            return Err(BfdError::Config("hash pepper must not be empty".into()));
        }
        if iterations == 0 {
            return Err(BfdError::Config("hash iterations must be positive".into()));
        }
        Ok(Self {
            pepper: pepper.into(),
            iterations,
        })
    }

    /// Pepper given as a hex string, the form it is distributed in.
    pub fn from_hex_pepper(pepper: &str, iterations: u32) -> Result<Self> {
        let bytes = hex::decode(pepper.trim())
            .map_err(|e| BfdError::Config(format!("hash pepper is not valid hex: {e}")))?;
        Self::new(bytes, iterations)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl fmt::Debug for IdHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdHasher")
            .field("pepper", &"<redacted>")
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl IdentifierHash for IdHasher {
    fn compute(&self, identifier: &str) -> Result<String> {
        if identifier.is_empty() {
            return Err(BfdError::Hashing("cannot hash an empty identifier".into()));
        }
        let mut key = [0u8; HASH_BYTES];
        pbkdf2_hmac::<Sha256>(identifier.as_bytes(), &self.pepper, self.iterations, &mut key);
        Ok(hex::encode(key))
    }
}

/// Point-in-time counters for a [`CachedIdHasher`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HasherStats {
    pub lookups: u64,
    /// Successful underlying hash computations
    pub computations: u64,
    /// Lookups where the cached path failed and a direct computation was made
    pub fallbacks: u64,
}

impl HasherStats {
    pub fn hits(&self) -> u64 {
        self.lookups
            .saturating_sub(self.computations)
            .saturating_sub(self.fallbacks)
    }
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    computations: AtomicU64,
    fallbacks: AtomicU64,
}

/// Wraps an [`IdentifierHash`] with a size-bounded cache.
///
/// The cache only saves work: results are identical with it full, empty or
/// disabled (capacity 0). When filling the cache fails the hash is computed
/// once more directly and that result, success or error, is returned.
pub struct CachedIdHasher<H = IdHasher> {
    inner: H,
    cache: Option<Cache<String, String>>,
    counters: Counters,
}

impl<H: IdentifierHash> CachedIdHasher<H> {
    pub fn new(inner: H, capacity: u64) -> Self {
        let cache = (capacity > 0).then(|| Cache::new(capacity));
        Self {
            inner,
            cache,
            counters: Counters::default(),
        }
    }

    pub fn hash(&self, identifier: &str) -> Result<String> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        let Some(cache) = &self.cache else {
            return self.compute_direct(identifier);
        };

        let cached = cache.try_get_with(identifier.to_string(), || {
            let digest = self.inner.compute(identifier)?;
            self.counters.computations.fetch_add(1, Ordering::Relaxed);
            Ok::<_, BfdError>(digest)
        });

        match cached {
            Ok(digest) => Ok(digest),
            Err(err) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "Cached identifier hash failed; computing directly");
                self.inner.compute(identifier)
            },
        }
    }

    fn compute_direct(&self, identifier: &str) -> Result<String> {
        self.counters.computations.fetch_add(1, Ordering::Relaxed);
        self.inner.compute(identifier)
    }

    pub fn stats(&self) -> HasherStats {
        HasherStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }
}

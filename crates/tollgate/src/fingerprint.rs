// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display, Formatter};

use serde::{Serialize, Serializer};
use xxhash_rust::xxh3::xxh3_128;

/// Error returned when a request cannot be reduced to a [`Fingerprint`].
///
/// The request type failed to serialize, most commonly because it contains a map
/// whose keys are not strings.
#[ohno::error]
#[derive(Clone)]
#[display("request cannot be fingerprinted")]
pub struct FingerprintError;

/// Deterministic digest of a request's semantic fields.
///
/// A fingerprint is computed from the canonical serialization of a request: the request is
/// serialized into a JSON document whose object keys are written in sorted order at every
/// depth. Two requests that carry the same fields therefore share a fingerprint regardless of
/// the order in which the fields were inserted or declared.
///
/// The digest is XXH3-128. It is a cache key, not a security boundary.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
///
/// use tollgate::Fingerprint;
///
/// let mut first = HashMap::new();
/// first.insert("model", "small");
/// first.insert("prompt", "hello");
///
/// let mut second = HashMap::new();
/// second.insert("prompt", "hello");
/// second.insert("model", "small");
///
/// assert_eq!(Fingerprint::of(&first)?, Fingerprint::of(&second)?);
/// # Ok::<(), tollgate::FingerprintError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Computes the fingerprint of a serializable request.
    ///
    /// # Errors
    ///
    /// Returns [`FingerprintError`] if the request cannot be serialized.
    pub fn of<T: Serialize + ?Sized>(request: &T) -> Result<Self, FingerprintError> {
        Ok(Self(xxh3_128(&canonical_bytes(request)?)))
    }

    /// Creates a fingerprint from a raw digest.
    #[must_use]
    pub const fn from_raw(digest: u128) -> Self {
        Self(digest)
    }

    /// Returns the raw digest.
    #[must_use]
    pub const fn as_raw(self) -> u128 {
        self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// Compact JSON with object keys sorted at every depth, regardless of `serde_json::Map` ordering.
fn canonical_bytes<T: Serialize + ?Sized>(request: &T) -> Result<Vec<u8>, FingerprintError> {
    let mut value = serde_json::to_value(request).map_err(FingerprintError::caused_by)?;
    value.sort_all_objects();

    serde_json::to_vec(&value).map_err(FingerprintError::caused_by)
}

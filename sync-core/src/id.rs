//! Opaque 96-bit identifiers shared by every persisted entity (§3).
//!
//! Rendered the same way a document store's `ObjectId` is: 24 lowercase hex
//! characters. The engine never interprets the bytes (no embedded timestamp
//! decoding); it only needs equality, ordering for display, and a stable
//! wire format that round-trips through `jsonb`.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Id([u8; 12]);

impl Id {
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid id `{0}`: expected 24 hex characters")]
pub struct ParseIdError(String);

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 {
            return Err(ParseIdError(s.to_string()));
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| ParseIdError(s.to_string()))?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| ParseIdError(s.to_string()))?;
        }
        Ok(Id(bytes))
    }
}

impl TryFrom<String> for Id {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let id = Id::new();
        let s = id.to_string();
        assert_eq!(s.len(), 24);
        let parsed: Id = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abc".parse::<Id>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!("zzzzzzzzzzzzzzzzzzzzzzzz".parse::<Id>().is_err());
    }
}

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

/// Per-request identifier shared by every record a call produces
///
/// ULID based: unique across instances and sortable by creation time. Within
/// one process, ids are strictly increasing even inside the same millisecond.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusinessId(Ulid);

/// Returned when a string is not a valid business id
#[derive(Debug, thiserror::Error)]
#[error("invalid business id: {0}")]
pub struct InvalidBusinessId(String);

fn generator() -> &'static Mutex<Generator> {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    GENERATOR.get_or_init(|| Mutex::new(Generator::new()))
}

impl BusinessId {
    /// Generate the next id in process-wide monotonic order
    pub fn generate() -> Self {
        let next = generator()
            .lock()
            .map_or_else(|_| Ok(Ulid::new()), |mut generator| generator.generate());

        // Random-part overflow within one millisecond; a fresh ULID is still unique
        Self(next.unwrap_or_else(|_| Ulid::new()))
    }

    pub const fn as_ulid(&self) -> &Ulid {
        &self.0
    }
}

impl FromStr for BusinessId {
    type Err = InvalidBusinessId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self).map_err(|_| InvalidBusinessId(s.to_owned()))
    }
}

impl TryFrom<String> for BusinessId {
    type Error = InvalidBusinessId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusinessId> for String {
    fn from(id: BusinessId) -> Self {
        id.0.to_string()
    }
}

impl fmt::Debug for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusinessId({})", self.0)
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids: Vec<BusinessId> = (0..1000).map(|_| BusinessId::generate()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn parses_its_own_display() {
        let id = BusinessId::generate();
        let parsed: BusinessId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-ulid".parse::<BusinessId>().is_err());
    }
}

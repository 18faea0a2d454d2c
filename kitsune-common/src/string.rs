use core::{
    fmt::{self, Display},
    ops::Deref,
};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Short, usually inline string used for identifiers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KitsuneString(CompactString);

impl Deref for KitsuneString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0.as_str()
    }
}

impl<T: AsRef<str>> From<T> for KitsuneString {
    fn from(value: T) -> Self {
        KitsuneString(CompactString::from(value.as_ref()))
    }
}

impl<T: AsRef<str> + ?Sized> PartialEq<T> for KitsuneString {
    fn eq(&self, other: &T) -> bool {
        self.0.as_str() == other.as_ref()
    }
}

impl Display for KitsuneString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a connector, device, channel or property.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub KitsuneString);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T: AsRef<str>> From<T> for EntityId {
    fn from(value: T) -> Self {
        EntityId(KitsuneString::from(value))
    }
}

impl Deref for EntityId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

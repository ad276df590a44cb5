//! Room identity

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a shared room; every replica of a room shares one document
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub const DEFAULT: &'static str = "default";

    /// Derive a room from a page-style path.
    ///
    /// Leading, trailing and repeated slashes are dropped; an empty path
    /// maps to the default room.
    pub fn from_path(path: &str) -> Self {
        let segments: Vec<&str> = path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if segments.is_empty() {
            Self(Self::DEFAULT.to_string())
        } else {
            Self(segments.join("/"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RoomId {
    fn from(path: &str) -> Self {
        Self::from_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(RoomId::from_path("/team/standup/").as_str(), "team/standup");
        assert_eq!(RoomId::from_path("//a//b").as_str(), "a/b");
        assert_eq!(RoomId::from_path("").as_str(), "default");
        assert_eq!(RoomId::from_path("/").as_str(), "default");
        assert_eq!(RoomId::from("standup"), RoomId::from_path("/standup"));
    }
}

//! Peer identity: `(group-name, numeric-id)`, structurally equal and immutable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named participant in the transport — either a client or a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer {
    group: String,
    id: u64,
}

impl Peer {
    pub fn new(group: impl Into<String>, id: u64) -> Self {
        Self {
            group: group.into(),
            id,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        assert_eq!(Peer::new("server", 1), Peer::new("server", 1));
        assert_ne!(Peer::new("server", 1), Peer::new("server", 2));
        assert_ne!(Peer::new("server", 1), Peer::new("client", 1));
    }

    #[test]
    fn display_is_group_colon_id() {
        assert_eq!(Peer::new("server", 3).to_string(), "server:3");
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lock mode requested when acquiring a block from the cache.
///
/// Any number of `Read` holders may share a block; a `Write` holder excludes
/// everyone else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Shared, read-only access.
    Read,
    /// Exclusive access; writes mark the block dirty.
    Write,
}

impl Access {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Whether a new request in this mode can be granted while the block
    /// is held by `readers` shared holders and, if `writer`, one exclusive
    /// holder.
    pub fn compatible_with(self, readers: usize, writer: bool) -> bool {
        match self {
            Self::Read => !writer,
            Self::Write => !writer && readers == 0,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

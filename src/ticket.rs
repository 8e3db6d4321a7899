//! Ticket tokens: capability grants of rights over an object path

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol_core::{is_within, normalize_virtual};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket {0:?} is missing ':'")]
    MissingSeparator(String),
    #[error("ticket has no rights")]
    NoRights,
    #[error("unknown right {0:?}")]
    UnknownRight(char),
    #[error("duplicate right {0:?}")]
    DuplicateRight(char),
    #[error("bad ticket path: {0}")]
    BadPath(String),
}

/// Set of rights carried by a ticket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl Rights {
    pub const READ: Rights = Rights { read: true, write: false, delete: false };
    pub const WRITE: Rights = Rights { read: false, write: true, delete: false };
    pub const DELETE: Rights = Rights { read: false, write: false, delete: true };

    pub fn parse(s: &str) -> Result<Self, TicketError> {
        if s.is_empty() {
            return Err(TicketError::NoRights);
        }
        let mut rights = Rights::default();
        for c in s.chars() {
            let slot = match c {
                'r' => &mut rights.read,
                'w' => &mut rights.write,
                'd' => &mut rights.delete,
                other => return Err(TicketError::UnknownRight(other)),
            };
            if *slot {
                return Err(TicketError::DuplicateRight(c));
            }
            *slot = true;
        }
        Ok(rights)
    }

    /// True if every right in `other` is also in `self`.
    pub fn covers(&self, other: &Rights) -> bool {
        (self.read || !other.read) && (self.write || !other.write) && (self.delete || !other.delete)
    }

    pub fn overlaps(&self, other: &Rights) -> bool {
        (self.read && other.read) || (self.write && other.write) || (self.delete && other.delete)
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.delete {
            f.write_str("d")?;
        }
        Ok(())
    }
}

/// `<rights>:<path>`, e.g. `rw:/projects/report.txt`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket {
    pub rights: Rights,
    pub path: String,
}

impl Ticket {
    /// Parse a token, resolving a relative path against `cwd`.
    pub fn parse(token: &str, cwd: &str) -> Result<Self, TicketError> {
        let (rights, path) = token
            .split_once(':')
            .ok_or_else(|| TicketError::MissingSeparator(token.chars().take(32).collect()))?;
        let rights = Rights::parse(rights)?;
        let path = normalize_virtual(cwd, path).map_err(|e| TicketError::BadPath(e.to_string()))?;
        Ok(Self { rights, path })
    }

    /// A held ticket covers a request when it grants at least the requested
    /// rights on the same object or an ancestor directory.
    pub fn covers(&self, wanted: &Ticket) -> bool {
        self.rights.covers(&wanted.rights) && is_within(&wanted.path, &self.path)
    }

    /// Whether a filter on `self` blocks moving `wanted` along its edge.
    pub fn blocks(&self, wanted: &Ticket) -> bool {
        self.rights.overlaps(&wanted.rights)
            && (is_within(&wanted.path, &self.path) || is_within(&self.path, &wanted.path))
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rights, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticket() {
        let t = Ticket::parse("rw:notes.txt", "/docs").unwrap();
        assert!(t.rights.read && t.rights.write && !t.rights.delete);
        assert_eq!(t.path, "/docs/notes.txt");
        assert_eq!(t.to_string(), "rw:/docs/notes.txt");
    }

    #[test]
    fn test_parse_ticket_errors() {
        assert!(matches!(Ticket::parse("rw", "/"), Err(TicketError::MissingSeparator(_))));
        assert_eq!(Ticket::parse(":/a", "/"), Err(TicketError::NoRights));
        assert_eq!(Ticket::parse("rx:/a", "/"), Err(TicketError::UnknownRight('x')));
        assert_eq!(Ticket::parse("rr:/a", "/"), Err(TicketError::DuplicateRight('r')));
        assert!(matches!(Ticket::parse("r:../a", "/"), Err(TicketError::BadPath(_))));
    }

    #[test]
    fn test_directory_ticket_covers_contents() {
        let dir = Ticket::parse("rw:/docs", "/").unwrap();
        assert!(dir.covers(&Ticket::parse("r:/docs/a/b.txt", "/").unwrap()));
        assert!(!dir.covers(&Ticket::parse("d:/docs/a.txt", "/").unwrap()));
        assert!(!dir.covers(&Ticket::parse("r:/docsx", "/").unwrap()));
    }

    #[test]
    fn test_filter_blocks_overlapping() {
        let filter = Ticket::parse("w:/docs", "/").unwrap();
        assert!(filter.blocks(&Ticket::parse("rw:/docs/a", "/").unwrap()));
        assert!(!filter.blocks(&Ticket::parse("r:/docs/a", "/").unwrap()));
        assert!(filter.blocks(&Ticket::parse("w:/", "/").unwrap()));
        assert!(!filter.blocks(&Ticket::parse("w:/other", "/").unwrap()));
    }
}

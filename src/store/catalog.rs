//! Subjects, objects, tickets, links and filters, and the rules tying them together

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::StoreError;
use crate::protocol::limits;
use crate::protocol_core::{is_within, parent_of};
use crate::ticket::{Rights, Ticket};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub password: String,
    #[serde(default)]
    pub is_super: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub owner: String,
    pub kind: ObjectKind,
}

/// Blocks tickets with overlapping rights from moving `from` -> `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Filter {
    pub from: String,
    pub to: String,
    pub ticket: Ticket,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    subjects: BTreeMap<String, SubjectRecord>,
    objects: BTreeMap<String, ObjectRecord>,
    tickets: BTreeMap<String, BTreeSet<Ticket>>,
    links: BTreeSet<(String, String)>,
    filters: BTreeSet<Filter>,
}

fn valid_subject_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= limits::SUBJECT
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'@'))
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Add a subject without any authorization check (bootstrap, tests).
    pub fn add_subject(&mut self, name: &str, password: &str, is_super: bool) -> Result<(), StoreError> {
        if !valid_subject_name(name) {
            return Err(StoreError::Invalid(format!("bad subject name {:?}", name)));
        }
        if password.is_empty() {
            return Err(StoreError::Invalid("empty password".to_string()));
        }
        if self.subjects.contains_key(name) {
            return Err(StoreError::AlreadyExists(format!("subject {}", name)));
        }
        self.subjects.insert(name.to_string(), SubjectRecord { password: password.to_string(), is_super });
        Ok(())
    }

    pub fn secret(&self, name: &str) -> Option<String> {
        self.subjects.get(name).map(|s| s.password.clone())
    }

    pub fn subject_names(&self) -> Vec<String> {
        self.subjects.keys().cloned().collect()
    }

    pub fn tickets_of(&self, subject: &str) -> Vec<Ticket> {
        self.tickets.get(subject).map(|t| t.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn has_link(&self, from: &str, to: &str) -> bool {
        self.links.contains(&(from.to_string(), to.to_string()))
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    fn is_super(&self, name: &str) -> bool {
        self.subjects.get(name).map_or(false, |s| s.is_super)
    }

    fn require_subject(&self, name: &str) -> Result<(), StoreError> {
        if self.subjects.contains_key(name) {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("subject {}", name)))
        }
    }

    fn require_super(&self, name: &str) -> Result<(), StoreError> {
        if self.is_super(name) {
            Ok(())
        } else {
            Err(StoreError::Denied(format!("{} is not a super subject", name)))
        }
    }

    pub fn kind_of(&self, path: &str) -> Option<ObjectKind> {
        if path == "/" {
            return Some(ObjectKind::Directory);
        }
        self.objects.get(path).map(|o| o.kind)
    }

    fn owns(&self, subject: &str, path: &str) -> bool {
        let mut cur = Some(path);
        while let Some(p) = cur {
            if self.objects.get(p).map_or(false, |o| o.owner == subject) {
                return true;
            }
            cur = parent_of(p);
        }
        false
    }

    /// Super subjects and owners (of the object or an ancestor) hold every
    /// right; everyone else needs a covering ticket.
    pub fn has_right(&self, subject: &str, path: &str, rights: Rights) -> bool {
        if self.is_super(subject) || self.owns(subject, path) {
            return true;
        }
        let wanted = Ticket { rights, path: path.to_string() };
        self.tickets
            .get(subject)
            .map_or(false, |held| held.iter().any(|t| t.covers(&wanted)))
    }

    fn require_right(&self, subject: &str, path: &str, rights: Rights) -> Result<(), StoreError> {
        if self.has_right(subject, path, rights) {
            Ok(())
        } else {
            Err(StoreError::Denied(format!("{} lacks {} on {}", subject, rights, path)))
        }
    }

    fn require_kind(&self, path: &str, kind: ObjectKind) -> Result<(), StoreError> {
        match self.kind_of(path) {
            Some(k) if k == kind => Ok(()),
            Some(_) => {
                let noun = match kind {
                    ObjectKind::File => "file",
                    ObjectKind::Directory => "directory",
                };
                Err(StoreError::Invalid(format!("{} is not a {}", path, noun)))
            }
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    pub fn insert_object(&mut self, subject: &str, path: &str, kind: ObjectKind) -> Result<(), StoreError> {
        let parent = parent_of(path).ok_or_else(|| StoreError::AlreadyExists(path.to_string()))?;
        if self.kind_of(path).is_some() {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        self.require_kind(parent, ObjectKind::Directory)?;
        self.require_right(subject, parent, Rights::WRITE)?;
        self.objects.insert(path.to_string(), ObjectRecord { owner: subject.to_string(), kind });
        Ok(())
    }

    pub fn check_read(&self, subject: &str, path: &str) -> Result<(), StoreError> {
        self.require_kind(path, ObjectKind::File)?;
        self.require_right(subject, path, Rights::READ)
    }

    pub fn check_write(&self, subject: &str, path: &str) -> Result<(), StoreError> {
        self.require_kind(path, ObjectKind::File)?;
        self.require_right(subject, path, Rights::WRITE)
    }

    pub fn check_directory(&self, subject: &str, path: &str) -> Result<(), StoreError> {
        self.require_kind(path, ObjectKind::Directory)?;
        self.require_right(subject, path, Rights::READ)
    }

    /// Immediate children of `dir`; directories carry a trailing `/`.
    pub fn list_objects(&self, subject: &str, dir: &str) -> Result<Vec<String>, StoreError> {
        self.check_directory(subject, dir)?;
        Ok(self
            .objects
            .iter()
            .filter(|(p, _)| parent_of(p) == Some(dir))
            .filter_map(|(p, o)| {
                let name = p.rsplit('/').next()?;
                Some(match o.kind {
                    ObjectKind::Directory => format!("{}/", name),
                    ObjectKind::File => name.to_string(),
                })
            })
            .collect())
    }

    pub fn delete_object(&mut self, subject: &str, path: &str) -> Result<ObjectKind, StoreError> {
        if path == "/" {
            return Err(StoreError::Invalid("cannot delete the root directory".to_string()));
        }
        let kind = self.kind_of(path).ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        self.require_right(subject, path, Rights::DELETE)?;
        if kind == ObjectKind::Directory && self.objects.keys().any(|p| parent_of(p) == Some(path)) {
            return Err(StoreError::Invalid(format!("directory {} is not empty", path)));
        }
        self.objects.remove(path);
        for held in self.tickets.values_mut() {
            held.retain(|t| !is_within(&t.path, path));
        }
        Ok(kind)
    }

    pub fn give_ticket(&mut self, giver: &str, receiver: &str, ticket: &Ticket) -> Result<(), StoreError> {
        self.require_subject(receiver)?;
        self.transfer_ticket(giver, receiver, ticket)?;
        self.tickets.entry(receiver.to_string()).or_default().insert(ticket.clone());
        Ok(())
    }

    pub fn take_ticket(&mut self, taker: &str, source: &str, ticket: &Ticket) -> Result<(), StoreError> {
        self.require_subject(source)?;
        if !self.is_super(taker) && !self.has_link(taker, source) {
            return Err(StoreError::Denied(format!("no link {} -> {}", taker, source)));
        }
        if !self.has_right(source, &ticket.path, ticket.rights) {
            return Err(StoreError::Denied(format!("{} does not hold {}", source, ticket)));
        }
        self.check_filters(source, taker, ticket)?;
        self.tickets.entry(taker.to_string()).or_default().insert(ticket.clone());
        Ok(())
    }

    fn transfer_ticket(&self, giver: &str, receiver: &str, ticket: &Ticket) -> Result<(), StoreError> {
        if self.kind_of(&ticket.path).is_none() {
            return Err(StoreError::NotFound(ticket.path.clone()));
        }
        if !self.is_super(giver) && !self.has_link(giver, receiver) {
            return Err(StoreError::Denied(format!("no link {} -> {}", giver, receiver)));
        }
        self.require_right(giver, &ticket.path, ticket.rights)?;
        self.check_filters(giver, receiver, ticket)
    }

    fn check_filters(&self, from: &str, to: &str, ticket: &Ticket) -> Result<(), StoreError> {
        if self.filters.iter().any(|f| f.from == from && f.to == to && f.ticket.blocks(ticket)) {
            return Err(StoreError::Denied(format!("filter {} -> {} blocks {}", from, to, ticket)));
        }
        Ok(())
    }

    pub fn make_subject(&mut self, creator: &str, name: &str, password: &str) -> Result<(), StoreError> {
        self.require_super(creator)?;
        self.add_subject(name, password, false)
    }

    pub fn make_link(&mut self, caller: &str, from: &str, to: &str) -> Result<(), StoreError> {
        self.require_super(caller)?;
        self.require_subject(from)?;
        self.require_subject(to)?;
        self.links.insert((from.to_string(), to.to_string()));
        Ok(())
    }

    pub fn make_filter(&mut self, caller: &str, from: &str, to: &str, ticket: &Ticket) -> Result<(), StoreError> {
        self.require_super(caller)?;
        self.require_subject(from)?;
        self.require_subject(to)?;
        self.filters.insert(Filter { from: from.to_string(), to: to.to_string(), ticket: ticket.clone() });
        Ok(())
    }

    /// Remove filters originating at `subject`; returns how many went.
    pub fn clear_filters(&mut self, caller: &str, subject: &str) -> Result<usize, StoreError> {
        self.require_super(caller)?;
        self.require_subject(subject)?;
        let before = self.filters.len();
        self.filters.retain(|f| f.from != subject);
        Ok(before - self.filters.len())
    }

    /// Remove links originating at `subject`; returns how many went.
    pub fn clear_links(&mut self, caller: &str, subject: &str) -> Result<usize, StoreError> {
        self.require_super(caller)?;
        self.require_subject(subject)?;
        let before = self.links.len();
        self.links.retain(|(from, _)| from != subject);
        Ok(before - self.links.len())
    }

    /// Objects owned by the deleted subject pass to `caller`.
    pub fn delete_subject(&mut self, caller: &str, subject: &str) -> Result<(), StoreError> {
        self.require_super(caller)?;
        self.require_subject(subject)?;
        if caller == subject {
            return Err(StoreError::Invalid("a subject cannot delete itself".to_string()));
        }
        self.subjects.remove(subject);
        self.tickets.remove(subject);
        self.links.retain(|(from, to)| from != subject && to != subject);
        self.filters.retain(|f| f.from != subject && f.to != subject);
        for object in self.objects.values_mut() {
            if object.owner == subject {
                object.owner = caller.to_string();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        let mut c = Catalog::default();
        c.add_subject("root", "rootpw", true).unwrap();
        c.add_subject("alice", "alicepw", false).unwrap();
        c.add_subject("bob", "bobpw", false).unwrap();
        c.insert_object("root", "/shared", ObjectKind::Directory).unwrap();
        c
    }

    fn ticket(s: &str) -> Ticket {
        Ticket::parse(s, "/").unwrap()
    }

    #[test]
    fn test_insert_requires_write_on_parent() {
        let mut c = catalog();
        assert!(matches!(
            c.insert_object("alice", "/shared/a.txt", ObjectKind::File),
            Err(StoreError::Denied(_))
        ));
        c.give_ticket("root", "alice", &ticket("w:/shared")).unwrap();
        c.insert_object("alice", "/shared/a.txt", ObjectKind::File).unwrap();
        assert!(matches!(
            c.insert_object("alice", "/shared/a.txt", ObjectKind::File),
            Err(StoreError::AlreadyExists(_))
        ));
        // Owner can read back without an explicit ticket
        c.check_read("alice", "/shared/a.txt").unwrap();
        assert!(c.check_read("bob", "/shared/a.txt").is_err());
    }

    #[test]
    fn test_insert_needs_existing_parent_directory() {
        let mut c = catalog();
        assert!(matches!(c.insert_object("root", "/nope/a", ObjectKind::File), Err(StoreError::NotFound(_))));
        c.insert_object("root", "/f", ObjectKind::File).unwrap();
        assert!(matches!(c.insert_object("root", "/f/a", ObjectKind::File), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_give_requires_link_and_held_rights() {
        let mut c = catalog();
        c.give_ticket("root", "alice", &ticket("rw:/shared")).unwrap();
        let t = ticket("r:/shared");
        assert!(matches!(c.give_ticket("alice", "bob", &t), Err(StoreError::Denied(_))));
        c.make_link("root", "alice", "bob").unwrap();
        c.give_ticket("alice", "bob", &t).unwrap();
        assert!(c.has_right("bob", "/shared", Rights::READ));
        assert!(!c.has_right("bob", "/shared", Rights::WRITE));
        // Cannot give more than held
        assert!(c.give_ticket("alice", "bob", &ticket("d:/shared")).is_err());
    }

    #[test]
    fn test_take_uses_link_direction() {
        let mut c = catalog();
        c.give_ticket("root", "alice", &ticket("r:/shared")).unwrap();
        let t = ticket("r:/shared");
        assert!(c.take_ticket("bob", "alice", &t).is_err());
        c.make_link("root", "alice", "bob").unwrap();
        assert!(c.take_ticket("bob", "alice", &t).is_err());
        c.make_link("root", "bob", "alice").unwrap();
        c.take_ticket("bob", "alice", &t).unwrap();
        assert!(c.has_right("bob", "/shared", Rights::READ));
    }

    #[test]
    fn test_filter_blocks_and_clears() {
        let mut c = catalog();
        c.give_ticket("root", "alice", &ticket("rw:/shared")).unwrap();
        c.make_link("root", "alice", "bob").unwrap();
        c.make_filter("root", "alice", "bob", &ticket("w:/shared")).unwrap();
        assert!(c.give_ticket("alice", "bob", &ticket("w:/shared")).is_err());
        c.give_ticket("alice", "bob", &ticket("r:/shared")).unwrap();
        assert_eq!(c.clear_filters("root", "alice").unwrap(), 1);
        c.give_ticket("alice", "bob", &ticket("w:/shared")).unwrap();
    }

    #[test]
    fn test_admin_operations_need_super() {
        let mut c = catalog();
        assert!(matches!(c.make_subject("alice", "carol", "pw"), Err(StoreError::Denied(_))));
        assert!(matches!(c.make_link("alice", "alice", "bob"), Err(StoreError::Denied(_))));
        c.make_subject("root", "carol", "pw").unwrap();
        assert_eq!(c.secret("carol").as_deref(), Some("pw"));
        assert!(matches!(c.make_subject("root", "bad name", "pw"), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_delete_subject_cleans_edges() {
        let mut c = catalog();
        c.make_link("root", "alice", "bob").unwrap();
        c.make_link("root", "bob", "alice").unwrap();
        c.give_ticket("root", "alice", &ticket("r:/shared")).unwrap();
        c.delete_subject("root", "alice").unwrap();
        assert!(c.secret("alice").is_none());
        assert!(!c.has_link("bob", "alice"));
        assert!(c.tickets_of("alice").is_empty());
        assert!(c.delete_subject("root", "root").is_err());
    }

    #[test]
    fn test_delete_object_rules() {
        let mut c = catalog();
        c.insert_object("root", "/shared/a", ObjectKind::File).unwrap();
        assert!(matches!(c.delete_object("root", "/shared"), Err(StoreError::Invalid(_))));
        assert!(matches!(c.delete_object("bob", "/shared/a"), Err(StoreError::Denied(_))));
        c.give_ticket("root", "bob", &ticket("r:/shared/a")).unwrap();
        assert_eq!(c.delete_object("root", "/shared/a").unwrap(), ObjectKind::File);
        assert!(c.tickets_of("bob").is_empty());
        c.delete_object("root", "/shared").unwrap();
        assert!(c.delete_object("root", "/").is_err());
    }

    #[test]
    fn test_list_objects() {
        let mut c = catalog();
        c.insert_object("root", "/shared/a.txt", ObjectKind::File).unwrap();
        c.insert_object("root", "/shared/sub", ObjectKind::Directory).unwrap();
        c.insert_object("root", "/shared/sub/deep", ObjectKind::File).unwrap();
        assert_eq!(c.list_objects("root", "/shared").unwrap(), vec!["a.txt".to_string(), "sub/".to_string()]);
        assert_eq!(c.list_objects("root", "/").unwrap(), vec!["shared/".to_string()]);
        assert!(c.list_objects("bob", "/shared").is_err());
    }
}

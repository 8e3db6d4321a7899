//! Storage collaborator: subject secrets, object content and the access-control catalog.
//!
//! The engine talks to storage only through [`Store`]. [`CatalogStore`] applies
//! the catalog rules once and leaves content handling to a [`Contents`]
//! backend, either in memory ([`memory`]) or on disk ([`fs`]).

pub mod catalog;
pub mod fs;
pub mod memory;

use std::io::{Read, Write};
use thiserror::Error;

pub use catalog::{Catalog, ObjectKind};
pub use fs::FsStore;
pub use memory::{MemoryStore, StoreEvent};

use crate::ticket::Ticket;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Operations the protocol engine needs from storage.
///
/// Every operation that acts on behalf of a subject takes the caller's
/// identity first; paths are normalized virtual paths.
pub trait Store {
    fn subject_secret(&self, subject: &str) -> Result<Option<String>, StoreError>;
    fn object_exists(&self, path: &str) -> bool;
    /// Register a new, empty file owned by `subject`.
    fn insert_object(&mut self, subject: &str, path: &str) -> Result<(), StoreError>;
    fn open_read(&mut self, subject: &str, path: &str) -> Result<Box<dyn Read>, StoreError>;
    fn open_write(&mut self, subject: &str, path: &str) -> Result<Box<dyn Write>, StoreError>;
    fn list_subjects(&self, subject: &str) -> Result<Vec<String>, StoreError>;
    fn list_objects(&self, subject: &str, dir: &str) -> Result<Vec<String>, StoreError>;
    fn give_ticket(&mut self, giver: &str, receiver: &str, ticket: &Ticket) -> Result<(), StoreError>;
    fn take_ticket(&mut self, taker: &str, source: &str, ticket: &Ticket) -> Result<(), StoreError>;
    fn make_directory(&mut self, subject: &str, path: &str) -> Result<(), StoreError>;
    fn make_subject(&mut self, creator: &str, name: &str, password: &str) -> Result<(), StoreError>;
    /// Succeeds when `path` is a directory `subject` may read.
    fn directory_exists(&self, subject: &str, path: &str) -> Result<(), StoreError>;
    fn make_filter(&mut self, caller: &str, from: &str, to: &str, ticket: &Ticket) -> Result<(), StoreError>;
    fn make_link(&mut self, caller: &str, from: &str, to: &str) -> Result<(), StoreError>;
    fn delete_object(&mut self, subject: &str, path: &str) -> Result<(), StoreError>;
    fn clear_filters(&mut self, caller: &str, subject: &str) -> Result<usize, StoreError>;
    fn clear_links(&mut self, caller: &str, subject: &str) -> Result<usize, StoreError>;
    fn delete_subject(&mut self, caller: &str, subject: &str) -> Result<(), StoreError>;
}

/// Where object bytes live, and where the catalog is persisted.
pub trait Contents {
    fn create(&mut self, path: &str) -> Result<(), StoreError>;
    fn make_dir(&mut self, path: &str) -> Result<(), StoreError>;
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read>, StoreError>;
    fn open_write(&mut self, path: &str) -> Result<Box<dyn Write>, StoreError>;
    fn remove(&mut self, path: &str, kind: ObjectKind) -> Result<(), StoreError>;
    fn persist(&mut self, catalog: &Catalog) -> Result<(), StoreError>;
}

/// A catalog plus a content backend.
pub struct CatalogStore<C: Contents> {
    catalog: Catalog,
    contents: C,
}

impl<C: Contents> CatalogStore<C> {
    pub fn new(catalog: Catalog, contents: C) -> Self {
        Self { catalog, contents }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn contents(&self) -> &C {
        &self.contents
    }

    /// Add a subject directly, bypassing authorization. Used to bootstrap
    /// the first super subject.
    pub fn add_subject(&mut self, name: &str, password: &str, is_super: bool) -> Result<(), StoreError> {
        self.update(|c| c.add_subject(name, password, is_super))
    }

    /// Apply a catalog mutation and persist it if it succeeded.
    fn update<R>(&mut self, f: impl FnOnce(&mut Catalog) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let out = f(&mut self.catalog)?;
        self.contents.persist(&self.catalog)?;
        Ok(out)
    }
}

impl<C: Contents> Store for CatalogStore<C> {
    fn subject_secret(&self, subject: &str) -> Result<Option<String>, StoreError> {
        Ok(self.catalog.secret(subject))
    }

    fn object_exists(&self, path: &str) -> bool {
        self.catalog.kind_of(path).is_some()
    }

    fn insert_object(&mut self, subject: &str, path: &str) -> Result<(), StoreError> {
        self.catalog.insert_object(subject, path, ObjectKind::File)?;
        if let Err(e) = self.contents.create(path) {
            // Keep catalog and content in step
            let _ = self.catalog.delete_object(subject, path);
            return Err(e);
        }
        self.contents.persist(&self.catalog)
    }

    fn open_read(&mut self, subject: &str, path: &str) -> Result<Box<dyn Read>, StoreError> {
        self.catalog.check_read(subject, path)?;
        self.contents.open_read(path)
    }

    fn open_write(&mut self, subject: &str, path: &str) -> Result<Box<dyn Write>, StoreError> {
        self.catalog.check_write(subject, path)?;
        self.contents.open_write(path)
    }

    fn list_subjects(&self, subject: &str) -> Result<Vec<String>, StoreError> {
        if self.catalog.secret(subject).is_none() {
            return Err(StoreError::NotFound(format!("subject {}", subject)));
        }
        Ok(self.catalog.subject_names())
    }

    fn list_objects(&self, subject: &str, dir: &str) -> Result<Vec<String>, StoreError> {
        self.catalog.list_objects(subject, dir)
    }

    fn give_ticket(&mut self, giver: &str, receiver: &str, ticket: &Ticket) -> Result<(), StoreError> {
        self.update(|c| c.give_ticket(giver, receiver, ticket))
    }

    fn take_ticket(&mut self, taker: &str, source: &str, ticket: &Ticket) -> Result<(), StoreError> {
        self.update(|c| c.take_ticket(taker, source, ticket))
    }

    fn make_directory(&mut self, subject: &str, path: &str) -> Result<(), StoreError> {
        self.catalog.insert_object(subject, path, ObjectKind::Directory)?;
        if let Err(e) = self.contents.make_dir(path) {
            let _ = self.catalog.delete_object(subject, path);
            return Err(e);
        }
        self.contents.persist(&self.catalog)
    }

    fn make_subject(&mut self, creator: &str, name: &str, password: &str) -> Result<(), StoreError> {
        self.update(|c| c.make_subject(creator, name, password))
    }

    fn directory_exists(&self, subject: &str, path: &str) -> Result<(), StoreError> {
        self.catalog.check_directory(subject, path)
    }

    fn make_filter(&mut self, caller: &str, from: &str, to: &str, ticket: &Ticket) -> Result<(), StoreError> {
        self.update(|c| c.make_filter(caller, from, to, ticket))
    }

    fn make_link(&mut self, caller: &str, from: &str, to: &str) -> Result<(), StoreError> {
        self.update(|c| c.make_link(caller, from, to))
    }

    fn delete_object(&mut self, subject: &str, path: &str) -> Result<(), StoreError> {
        // Deletion also drops tickets, so restore the whole catalog on failure
        let before = self.catalog.clone();
        let kind = self.catalog.delete_object(subject, path)?;
        if let Err(e) = self.contents.remove(path, kind) {
            self.catalog = before;
            return Err(e);
        }
        self.contents.persist(&self.catalog)
    }

    fn clear_filters(&mut self, caller: &str, subject: &str) -> Result<usize, StoreError> {
        self.update(|c| c.clear_filters(caller, subject))
    }

    fn clear_links(&mut self, caller: &str, subject: &str) -> Result<usize, StoreError> {
        self.update(|c| c.clear_links(caller, subject))
    }

    fn delete_subject(&mut self, caller: &str, subject: &str) -> Result<(), StoreError> {
        self.update(|c| c.delete_subject(caller, subject))
    }
}

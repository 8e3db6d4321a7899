//! In-memory content backend. Clones share state, so a test can keep a handle
//! while the engine owns the store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use super::{Catalog, CatalogStore, Contents, ObjectKind, StoreError};

/// Content operations in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Create(String),
    MakeDir(String),
    OpenRead(String),
    OpenWrite(String),
    Write { path: String, len: usize },
    Remove(String),
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, Vec<u8>>,
    events: Vec<StoreEvent>,
}

#[derive(Clone, Default)]
pub struct MemoryContents {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryContents {
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(path).cloned()
    }

    /// Seed content for a path without recording an event.
    pub fn put(&self, path: &str, data: &[u8]) {
        self.inner.lock().files.insert(path.to_string(), data.to_vec());
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.inner.lock().events.clone()
    }

    fn record(&self, event: StoreEvent) {
        self.inner.lock().events.push(event);
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<Inner>>,
    path: String,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.files.entry(self.path.clone()).or_default().extend_from_slice(buf);
        inner.events.push(StoreEvent::Write { path: self.path.clone(), len: buf.len() });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Contents for MemoryContents {
    fn create(&mut self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.files.insert(path.to_string(), Vec::new());
        inner.events.push(StoreEvent::Create(path.to_string()));
        Ok(())
    }

    fn make_dir(&mut self, path: &str) -> Result<(), StoreError> {
        self.record(StoreEvent::MakeDir(path.to_string()));
        Ok(())
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read>, StoreError> {
        let data = self.file(path).ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        self.record(StoreEvent::OpenRead(path.to_string()));
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&mut self, path: &str) -> Result<Box<dyn Write>, StoreError> {
        {
            let mut inner = self.inner.lock();
            inner.files.insert(path.to_string(), Vec::new());
            inner.events.push(StoreEvent::OpenWrite(path.to_string()));
        }
        Ok(Box::new(MemoryWriter { inner: Arc::clone(&self.inner), path: path.to_string() }))
    }

    fn remove(&mut self, path: &str, _kind: ObjectKind) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.files.remove(path);
        inner.events.push(StoreEvent::Remove(path.to_string()));
        Ok(())
    }

    fn persist(&mut self, _catalog: &Catalog) -> Result<(), StoreError> {
        Ok(())
    }
}

pub type MemoryStore = CatalogStore<MemoryContents>;

impl CatalogStore<MemoryContents> {
    pub fn in_memory() -> Self {
        CatalogStore::new(Catalog::default(), MemoryContents::default())
    }
}

//! On-disk store: object bytes under `<root>/objects`, catalog in `<root>/catalog.json`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::{Catalog, CatalogStore, Contents, ObjectKind, StoreError};

const CATALOG_FILE: &str = "catalog.json";
const OBJECTS_DIR: &str = "objects";

pub struct DiskContents {
    root: PathBuf,
}

impl DiskContents {
    /// Host path for a normalized virtual path.
    fn host_path(&self, path: &str) -> PathBuf {
        let mut out = self.root.join(OBJECTS_DIR);
        for part in path.split('/').filter(|p| !p.is_empty()) {
            out.push(part);
        }
        out
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }
}

impl Contents for DiskContents {
    fn create(&mut self, path: &str) -> Result<(), StoreError> {
        File::create(self.host_path(path))?;
        Ok(())
    }

    fn make_dir(&mut self, path: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.host_path(path))?;
        Ok(())
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read>, StoreError> {
        let file = File::open(self.host_path(path))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn open_write(&mut self, path: &str) -> Result<Box<dyn Write>, StoreError> {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(self.host_path(path))?;
        Ok(Box::new(file))
    }

    fn remove(&mut self, path: &str, kind: ObjectKind) -> Result<(), StoreError> {
        let host = self.host_path(path);
        let res = match kind {
            ObjectKind::File => fs::remove_file(&host),
            ObjectKind::Directory => fs::remove_dir(&host),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file, sync, then rename over the old catalog.
    fn persist(&mut self, catalog: &Catalog) -> Result<(), StoreError> {
        let path = self.catalog_path();
        let temp_path = path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = file.metadata()?.permissions();
                perms.set_mode(0o600);
                file.set_permissions(perms)?;
            }
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, catalog)?;
            writer.write_all(b"\n")?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

pub type FsStore = CatalogStore<DiskContents>;

impl CatalogStore<DiskContents> {
    /// Open (or initialise) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let contents = DiskContents { root: root.to_path_buf() };
        fs::create_dir_all(contents.host_path("/"))?;
        let catalog = match File::open(contents.catalog_path()) {
            Ok(file) => serde_json::from_reader(BufReader::new(file))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(CatalogStore::new(catalog, contents))
    }
}

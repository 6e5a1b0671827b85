//! The persistence contract the directory consumes.
//!
//! The back-end mirrors the directory tree as a hierarchical
//! namespace addressed by slash-separated paths (the root is the
//! empty path). Every operation is fallible; the directory surfaces
//! failures to the originator and never retries on its own.
use crate::acl::AclSheetSet;
use crate::error::{DirectoryError, Error};
use crate::session::SessionSnapshot;
use crate::xml::Element;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A child entry reported by [`Storage::read_subdirectory`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageNode {
    /// Name of the child within its parent.
    pub name: String,
    /// `None` for a subdirectory, the plugin type for a leaf.
    pub node_type: Option<String>,
}

/// Operations a storage back-end must provide.
///
/// The on-disk layout is the back-end's business; the directory only
/// relies on these operations round-tripping.
pub trait Storage: Send {
    /// Lists the children of a subdirectory.
    fn read_subdirectory(&self, path: &str) -> Result<Vec<StorageNode>, Error>;

    /// Creates an empty subdirectory.
    fn create_subdirectory(&mut self, path: &str) -> Result<(), Error>;

    /// Removes a node and, for subdirectories, its subtree.
    fn remove_node(&mut self, node_type: Option<&str>, path: &str) -> Result<(), Error>;

    /// Reads the session snapshot of a leaf.
    fn read_session(&self, node_type: &str, path: &str) -> Result<SessionSnapshot, Error>;

    /// Writes the session snapshot of a leaf.
    fn write_session(
        &mut self,
        node_type: &str,
        path: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), Error>;

    /// Reads the ACL sheet set stored for a node. Missing data is an
    /// empty set.
    fn read_acl(&self, path: &str) -> Result<AclSheetSet, Error>;

    /// Writes the ACL sheet set of a node.
    fn write_acl(&mut self, path: &str, sheets: &AclSheetSet) -> Result<(), Error>;
}

impl Storage for Box<dyn Storage> {
    fn read_subdirectory(&self, path: &str) -> Result<Vec<StorageNode>, Error> {
        (**self).read_subdirectory(path)
    }

    fn create_subdirectory(&mut self, path: &str) -> Result<(), Error> {
        (**self).create_subdirectory(path)
    }

    fn remove_node(&mut self, node_type: Option<&str>, path: &str) -> Result<(), Error> {
        (**self).remove_node(node_type, path)
    }

    fn read_session(&self, node_type: &str, path: &str) -> Result<SessionSnapshot, Error> {
        (**self).read_session(node_type, path)
    }

    fn write_session(
        &mut self,
        node_type: &str,
        path: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), Error> {
        (**self).write_session(node_type, path, snapshot)
    }

    fn read_acl(&self, path: &str) -> Result<AclSheetSet, Error> {
        (**self).read_acl(path)
    }

    fn write_acl(&mut self, path: &str, sheets: &AclSheetSet) -> Result<(), Error> {
        (**self).write_acl(path, sheets)
    }
}

#[derive(Clone, Debug)]
enum MemoryEntry {
    Subdirectory,
    Leaf {
        node_type: String,
        /// XML serialisation of the session snapshot, exercising the
        /// same format a file back-end would write.
        content: Vec<u8>,
    },
}

/// Keeps the persisted namespace in process memory.
///
/// Serves the tests and servers running without a disk back-end.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: HashMap<String, MemoryEntry>,
    acls: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    /// Returns an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            None => true,
            Some(("", _)) => true,
            Some((parent, _)) => matches!(
                self.entries.get(parent),
                Some(MemoryEntry::Subdirectory)
            ),
        }
    }
}

impl Storage for MemoryStorage {
    fn read_subdirectory(&self, path: &str) -> Result<Vec<StorageNode>, Error> {
        if !path.is_empty() && !matches!(self.entries.get(path), Some(MemoryEntry::Subdirectory)) {
            return Err(DirectoryError::Failed(format!("no subdirectory at {:?}", path)).into());
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut children = Vec::new();
        for (entry_path, entry) in &self.entries {
            let Some(rest) = entry_path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            children.push(StorageNode {
                name: rest.to_string(),
                node_type: match entry {
                    MemoryEntry::Subdirectory => None,
                    MemoryEntry::Leaf { node_type, .. } => Some(node_type.clone()),
                },
            });
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn create_subdirectory(&mut self, path: &str) -> Result<(), Error> {
        if self.entries.contains_key(path) {
            return Err(DirectoryError::Failed(format!("{:?} already exists", path)).into());
        }
        if !self.parent_exists(path) {
            return Err(DirectoryError::Failed(format!("no parent for {:?}", path)).into());
        }
        self.entries.insert(path.to_string(), MemoryEntry::Subdirectory);
        Ok(())
    }

    fn remove_node(&mut self, _node_type: Option<&str>, path: &str) -> Result<(), Error> {
        if self.entries.remove(path).is_none() {
            return Err(DirectoryError::Failed(format!("nothing stored at {:?}", path)).into());
        }
        let prefix = format!("{}/", path);
        self.entries.retain(|entry_path, _| !entry_path.starts_with(&prefix));
        self.acls.retain(|acl_path, _| {
            acl_path != path && !acl_path.starts_with(&prefix)
        });
        Ok(())
    }

    fn read_session(&self, node_type: &str, path: &str) -> Result<SessionSnapshot, Error> {
        match self.entries.get(path) {
            Some(MemoryEntry::Leaf {
                node_type: stored,
                content,
            }) if stored == node_type => {
                SessionSnapshot::from_xml(&Element::parse(content)?)
            }
            Some(MemoryEntry::Leaf { node_type: stored, .. }) => Err(DirectoryError::Failed(
                format!("{:?} has type {:?}, not {:?}", path, stored, node_type),
            )
            .into()),
            _ => Err(DirectoryError::Failed(format!("no session at {:?}", path)).into()),
        }
    }

    fn write_session(
        &mut self,
        node_type: &str,
        path: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), Error> {
        if !self.parent_exists(path) {
            return Err(DirectoryError::Failed(format!("no parent for {:?}", path)).into());
        }
        self.entries.insert(
            path.to_string(),
            MemoryEntry::Leaf {
                node_type: node_type.to_string(),
                content: snapshot.to_xml().to_bytes(),
            },
        );
        Ok(())
    }

    fn read_acl(&self, path: &str) -> Result<AclSheetSet, Error> {
        match self.acls.get(path) {
            Some(bytes) => AclSheetSet::from_xml(&Element::parse(bytes)?),
            None => Ok(AclSheetSet::new()),
        }
    }

    fn write_acl(&mut self, path: &str, sheets: &AclSheetSet) -> Result<(), Error> {
        self.acls.insert(
            path.to_string(),
            sheets.to_xml(Element::new("acl")).to_bytes(),
        );
        Ok(())
    }
}

/// Persists the namespace below a root directory on disk.
///
/// A subdirectory maps to a directory, a leaf to a file named
/// `<name>.<node_type>` holding the session XML, and a node's ACL to
/// a `<name>.acl` sidecar next to it (the root's ACL is `.acl` inside
/// the root). Data written by one process is read back by the next,
/// which is what autosave relies on.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens a store below `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| io_failed("create", &root, &err))?;
        Ok(Self { root })
    }

    /// The root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn leaf_path(&self, node_type: &str, path: &str) -> PathBuf {
        self.root.join(format!("{}.{}", path, node_type))
    }

    fn acl_path(&self, path: &str) -> PathBuf {
        self.root.join(format!("{}.acl", path))
    }

    /// Removes a node's ACL sidecar; a missing sidecar is fine.
    fn remove_acl(&self, path: &str) -> Result<(), Error> {
        let sidecar = self.acl_path(path);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_failed("remove", &sidecar, &err)),
        }
    }
}

impl Storage for FileStorage {
    fn read_subdirectory(&self, path: &str) -> Result<Vec<StorageNode>, Error> {
        let dir = self.dir_path(path);
        let entries = std::fs::read_dir(&dir).map_err(|err| io_failed("read", &dir, &err))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_failed("read", &dir, &err))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let kind = entry
                .file_type()
                .map_err(|err| io_failed("read", &entry.path(), &err))?;
            if kind.is_dir() {
                children.push(StorageNode {
                    name,
                    node_type: None,
                });
            } else if let Some((stem, suffix)) = name.rsplit_once('.') {
                // ACL sidecars and nameless dot-files are not nodes.
                if suffix == "acl" || stem.is_empty() {
                    continue;
                }
                children.push(StorageNode {
                    name: stem.to_string(),
                    node_type: Some(suffix.to_string()),
                });
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn create_subdirectory(&mut self, path: &str) -> Result<(), Error> {
        let dir = self.dir_path(path);
        std::fs::create_dir(&dir).map_err(|err| io_failed("create", &dir, &err))
    }

    fn remove_node(&mut self, node_type: Option<&str>, path: &str) -> Result<(), Error> {
        match node_type {
            None => {
                let dir = self.dir_path(path);
                std::fs::remove_dir_all(&dir).map_err(|err| io_failed("remove", &dir, &err))?;
            }
            Some(node_type) => {
                let file = self.leaf_path(node_type, path);
                std::fs::remove_file(&file).map_err(|err| io_failed("remove", &file, &err))?;
            }
        }
        self.remove_acl(path)
    }

    fn read_session(&self, node_type: &str, path: &str) -> Result<SessionSnapshot, Error> {
        let file = self.leaf_path(node_type, path);
        let bytes = std::fs::read(&file).map_err(|err| io_failed("read", &file, &err))?;
        SessionSnapshot::from_xml(&Element::parse(&bytes)?)
    }

    fn write_session(
        &mut self,
        node_type: &str,
        path: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), Error> {
        let file = self.leaf_path(node_type, path);
        std::fs::write(&file, snapshot.to_xml().to_bytes())
            .map_err(|err| io_failed("write", &file, &err))
    }

    fn read_acl(&self, path: &str) -> Result<AclSheetSet, Error> {
        let sidecar = self.acl_path(path);
        match std::fs::read(&sidecar) {
            Ok(bytes) => AclSheetSet::from_xml(&Element::parse(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(AclSheetSet::new()),
            Err(err) => Err(io_failed("read", &sidecar, &err)),
        }
    }

    fn write_acl(&mut self, path: &str, sheets: &AclSheetSet) -> Result<(), Error> {
        let sidecar = self.acl_path(path);
        std::fs::write(&sidecar, sheets.to_xml(Element::new("acl")).to_bytes())
            .map_err(|err| io_failed("write", &sidecar, &err))
    }
}

fn io_failed(action: &str, path: &Path, err: &std::io::Error) -> Error {
    DirectoryError::Failed(format!("cannot {} {}: {}", action, path.display(), err)).into()
}

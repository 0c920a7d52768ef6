use crate::diag::gate::Identity;
use crate::error::{GmdError, GmdResult};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, Weak};

type OpenFn = Box<dyn Fn(&Identity) -> GmdResult<Box<dyn Read + Send>> + Send + Sync>;
type AttrGet = Box<dyn Fn() -> u64 + Send + Sync>;
type AttrSet = Box<dyn Fn(u64) + Send + Sync>;

struct AttrOps {
    get: AttrGet,
    set: AttrSet,
}

enum NodeKind {
    Dir(Mutex<BTreeMap<String, Arc<Node>>>),
    File(OpenFn),
    Attr(AttrOps),
}

struct Node {
    name: String,
    kind: NodeKind,
}

impl Node {
    fn dir(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            kind: NodeKind::Dir(Mutex::new(BTreeMap::new())),
        })
    }

    fn children(&self) -> Option<&Mutex<BTreeMap<String, Arc<Node>>>> {
        match &self.kind {
            NodeKind::Dir(children) => Some(children),
            _ => None,
        }
    }
}

/// In-process read-only diagnostics tree.
///
/// Nodes come in three kinds: directories, views (opened per-reader with
/// the requester's identity) and numeric attributes. Creation returns a
/// handle whose drop removes the node again, which ties directory-entry
/// lifetime to the owning object's teardown path.
pub struct DiagFs {
    root: Arc<Node>,
}

impl DiagFs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::dir(""),
        }
    }

    /// Handle on the root directory. Dropping it does not remove the
    /// root.
    #[must_use]
    pub fn root(&self) -> DirHandle {
        DirHandle {
            node: Arc::clone(&self.root),
            parent: None,
        }
    }

    /// Creates a subdirectory.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::NodeExists`] when the name is already taken.
    pub fn create_dir(&self, parent: &DirHandle, name: &str) -> GmdResult<DirHandle> {
        let node = Node::dir(name);
        Self::link(parent, name, &node)?;
        Ok(DirHandle {
            node,
            parent: Some(Arc::downgrade(&parent.node)),
        })
    }

    /// Creates a view file. `open` runs once per reader and receives the
    /// requester's identity.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::NodeExists`] when the name is already taken.
    pub fn create_file<F>(&self, parent: &DirHandle, name: &str, open: F) -> GmdResult<FileHandle>
    where
        F: Fn(&Identity) -> GmdResult<Box<dyn Read + Send>> + Send + Sync + 'static,
    {
        let node = Arc::new(Node {
            name: name.to_owned(),
            kind: NodeKind::File(Box::new(open)),
        });
        Self::link(parent, name, &node)?;
        Ok(FileHandle {
            parent: Arc::downgrade(&parent.node),
            name: name.to_owned(),
        })
    }

    /// Creates a numeric attribute file. Reads are open to everyone;
    /// writes require a privileged requester.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::NodeExists`] when the name is already taken.
    pub fn create_attr<G, S>(
        &self,
        parent: &DirHandle,
        name: &str,
        get: G,
        set: S,
    ) -> GmdResult<FileHandle>
    where
        G: Fn() -> u64 + Send + Sync + 'static,
        S: Fn(u64) + Send + Sync + 'static,
    {
        let node = Arc::new(Node {
            name: name.to_owned(),
            kind: NodeKind::Attr(AttrOps {
                get: Box::new(get),
                set: Box::new(set),
            }),
        });
        Self::link(parent, name, &node)?;
        Ok(FileHandle {
            parent: Arc::downgrade(&parent.node),
            name: name.to_owned(),
        })
    }

    /// Opens a node for reading. Attribute files render as a decimal
    /// value followed by a newline.
    ///
    /// # Errors
    ///
    /// Fails when the path does not name a readable node. View-level
    /// access checks run later, on the first read of the returned
    /// reader.
    pub fn open(&self, path: &str, requester: &Identity) -> GmdResult<Box<dyn Read + Send>> {
        let node = self.resolve(path)?;
        match &node.kind {
            NodeKind::Dir(_) => Err(GmdError::General(format!("{path} is a directory"))),
            NodeKind::File(open) => open(requester),
            NodeKind::Attr(ops) => {
                let text = format!("{}\n", (ops.get)());
                Ok(Box::new(io::Cursor::new(text.into_bytes())))
            }
        }
    }

    /// Reads a whole view into a string.
    ///
    /// # Errors
    ///
    /// Propagates open and read failures, including access denials.
    pub fn read_to_string(&self, path: &str, requester: &Identity) -> GmdResult<String> {
        let mut reader = self.open(path, requester)?;
        let mut out = String::new();
        reader.read_to_string(&mut out)?;
        Ok(out)
    }

    /// Writes a numeric attribute.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::PermissionDenied`] for unprivileged
    /// requesters, and fails when the path is not an attribute.
    pub fn write_attr(&self, path: &str, requester: &Identity, value: u64) -> GmdResult<()> {
        let node = self.resolve(path)?;
        let NodeKind::Attr(ops) = &node.kind else {
            return Err(GmdError::General(format!("{path} is not writable")));
        };
        if !requester.is_root() {
            return Err(GmdError::PermissionDenied(requester.pid));
        }
        (ops.set)(value);
        Ok(())
    }

    /// Child names of a directory, sorted.
    ///
    /// # Errors
    ///
    /// Fails when the path does not name a directory.
    ///
    /// # Panics
    ///
    /// Panics if a directory mutex is poisoned.
    pub fn list(&self, path: &str) -> GmdResult<Vec<String>> {
        let node = self.resolve(path)?;
        let children = node
            .children()
            .ok_or_else(|| GmdError::General(format!("{path} is not a directory")))?;
        Ok(children.lock().unwrap().keys().cloned().collect())
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    fn resolve(&self, path: &str) -> GmdResult<Arc<Node>> {
        let mut node = Arc::clone(&self.root);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let children = node
                .children()
                .ok_or_else(|| GmdError::NodeNotFound(path.to_owned()))?;
            let next = children
                .lock()
                .unwrap()
                .get(segment)
                .cloned()
                .ok_or_else(|| GmdError::NodeNotFound(path.to_owned()))?;
            node = next;
        }
        Ok(node)
    }

    fn link(parent: &DirHandle, name: &str, node: &Arc<Node>) -> GmdResult<()> {
        let children = parent
            .node
            .children()
            .ok_or_else(|| GmdError::General(format!("{} is not a directory", parent.node.name)))?;
        let mut children = children.lock().unwrap();
        if children.contains_key(name) {
            return Err(GmdError::NodeExists(name.to_owned()));
        }
        children.insert(name.to_owned(), Arc::clone(node));
        Ok(())
    }
}

impl Default for DiagFs {
    fn default() -> Self {
        Self::new()
    }
}

fn unlink(parent: &Weak<Node>, name: &str) {
    if let Some(parent) = parent.upgrade() {
        if let Some(children) = parent.children() {
            children.lock().unwrap().remove(name);
        }
    }
}

/// Owned handle on a directory; dropping it removes the directory and
/// everything beneath it.
pub struct DirHandle {
    node: Arc<Node>,
    parent: Option<Weak<Node>>,
}

impl Drop for DirHandle {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            unlink(parent, &self.node.name);
        }
    }
}

impl fmt::Debug for DirHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirHandle")
            .field("name", &self.node.name)
            .finish()
    }
}

/// Owned handle on a file node; dropping it removes the file.
#[derive(Debug)]
pub struct FileHandle {
    parent: Weak<Node>,
    name: String,
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        unlink(&self.parent, &self.name);
    }
}

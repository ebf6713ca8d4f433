//! In-memory storage provider.
//!
//! Executes callouts synchronously against a path-keyed tree. Message
//! callouts are not supported; the harness uses this store for the file
//! transfer profile only.

use obex_core::callout::{AccessMode, OpenMode};
use obex_core::{Callout, CalloutOutput, CalloutResult, DirEntry, FileHandle, PeerAddress, StorageError};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File { data: Vec<u8>, readonly: bool },
    Dir,
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    pos: usize,
}

/// Path-keyed in-memory store
#[derive(Debug, Default)]
pub struct MemStore {
    nodes: BTreeMap<PathBuf, Node>,
    files: HashMap<FileHandle, OpenFile>,
    cursors: HashMap<PathBuf, (Vec<DirEntry>, usize)>,
    sessions: HashMap<PeerAddress, Vec<u8>>,
    next_handle: u32,
    closed: usize,
    bad_closes: usize,
}

impl MemStore {
    /// Store holding only the folder `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut store = Self::default();
        store.nodes.insert(root.into(), Node::Dir);
        store
    }

    /// Add a folder
    #[must_use]
    pub fn with_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.nodes.insert(path.into(), Node::Dir);
        self
    }

    /// Add a file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, data: &[u8]) -> Self {
        self.nodes.insert(
            path.into(),
            Node::File {
                data: data.to_vec(),
                readonly: false,
            },
        );
        self
    }

    /// Contents of the file at `path`
    #[must_use]
    pub fn file(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        match self.nodes.get(path.as_ref()) {
            Some(Node::File { data, .. }) => Some(data),
            _ => None,
        }
    }

    /// Whether anything exists at `path`
    #[must_use]
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.nodes.contains_key(path.as_ref())
    }

    /// Handles currently open
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.files.len()
    }

    /// Close calls received so far
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed
    }

    /// Close calls naming a handle that was not open
    #[must_use]
    pub fn bad_closes(&self) -> usize {
        self.bad_closes
    }

    /// Execute one callout
    pub fn execute(&mut self, callout: &Callout) -> CalloutResult {
        match callout {
            Callout::Open { path, mode, .. } => self.open(path, *mode),
            Callout::Read { handle, max_len } => {
                let file = self.files.get_mut(handle).ok_or(StorageError::NotFound)?;
                let data = match self.nodes.get(&file.path) {
                    Some(Node::File { data, .. }) => data,
                    _ => return Err(StorageError::NotFound),
                };
                let start = file.pos.min(data.len());
                let end = (start + max_len).min(data.len());
                file.pos = end;
                let bytes = data[start..end].to_vec();
                let eof = bytes.len() < *max_len;
                Ok(CalloutOutput::Data { bytes, eof })
            }
            Callout::Write { handle, data } => {
                let file = self.files.get_mut(handle).ok_or(StorageError::NotFound)?;
                let Some(Node::File { data: contents, .. }) = self.nodes.get_mut(&file.path) else {
                    return Err(StorageError::NotFound);
                };
                contents.truncate(file.pos);
                contents.extend_from_slice(data);
                file.pos += data.len();
                Ok(CalloutOutput::Written { len: data.len() })
            }
            Callout::Close { handle } => {
                self.closed += 1;
                if self.files.remove(handle).is_none() {
                    self.bad_closes += 1;
                    return Err(StorageError::NotFound);
                }
                Ok(CalloutOutput::Done)
            }
            Callout::Seek { handle, offset } => {
                let file = self.files.get_mut(handle).ok_or(StorageError::NotFound)?;
                file.pos = usize::try_from(*offset).map_err(|e| StorageError::Io(e.to_string()))?;
                Ok(CalloutOutput::Done)
            }
            Callout::Enumerate { dir, reset } => self.enumerate(dir, *reset),
            Callout::Access { path, mode } => match self.nodes.get(path) {
                None => Err(StorageError::NotFound),
                Some(Node::File { readonly: true, .. }) if *mode == AccessMode::Write => {
                    Err(StorageError::PermissionDenied)
                }
                Some(node) => Ok(CalloutOutput::Access {
                    is_dir: *node == Node::Dir,
                }),
            },
            Callout::Mkdir { path } => {
                if !self.parent_is_dir(path) {
                    return Err(StorageError::NotFound);
                }
                match self.nodes.get(path) {
                    Some(Node::Dir) => Ok(CalloutOutput::Done),
                    Some(_) => Err(StorageError::PermissionDenied),
                    None => {
                        self.nodes.insert(path.clone(), Node::Dir);
                        Ok(CalloutOutput::Done)
                    }
                }
            }
            Callout::Rmdir { path } => {
                if self.nodes.get(path) != Some(&Node::Dir) {
                    return Err(StorageError::NotFound);
                }
                if self.children(path).next().is_some() {
                    return Err(StorageError::NotEmpty);
                }
                self.nodes.remove(path);
                Ok(CalloutOutput::Done)
            }
            Callout::Unlink { path } => match self.nodes.get(path) {
                Some(Node::File { .. }) => {
                    self.nodes.remove(path);
                    Ok(CalloutOutput::Done)
                }
                _ => Err(StorageError::NotFound),
            },
            Callout::Rename { from, to, copy } => self.rename(from, to, *copy),
            Callout::Chmod { path, permissions } => match self.nodes.get_mut(path) {
                Some(Node::File { readonly, .. }) => {
                    *readonly = permissions & 0o200 == 0;
                    Ok(CalloutOutput::Done)
                }
                Some(Node::Dir) => Ok(CalloutOutput::Done),
                None => Err(StorageError::NotFound),
            },
            Callout::SaveSession { peer, record } => {
                self.sessions.insert(*peer, record.clone());
                Ok(CalloutOutput::Done)
            }
            Callout::LoadSession { peer } => self
                .sessions
                .get(peer)
                .cloned()
                .map(CalloutOutput::SessionRecord)
                .ok_or(StorageError::NotFound),
            Callout::UpdateInbox => Ok(CalloutOutput::Done),
            Callout::OpenMessage { .. }
            | Callout::PushMessage { .. }
            | Callout::MessageListNext { .. }
            | Callout::SetMessageStatus { .. } => Err(StorageError::Unsupported),
        }
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> CalloutResult {
        let (pos, size) = match mode {
            OpenMode::Read | OpenMode::ReadAt(_) => {
                let Some(Node::File { data, .. }) = self.nodes.get(path) else {
                    return Err(StorageError::NotFound);
                };
                let pos = match mode {
                    OpenMode::ReadAt(offset) => usize::try_from(offset).unwrap_or(usize::MAX),
                    _ => 0,
                };
                (pos, Some(data.len() as u64))
            }
            OpenMode::Create => {
                if !self.parent_is_dir(path) {
                    return Err(StorageError::NotFound);
                }
                if let Some(Node::File { readonly: true, .. } | Node::Dir) = self.nodes.get(path) {
                    return Err(StorageError::PermissionDenied);
                }
                self.nodes.insert(
                    path.to_path_buf(),
                    Node::File {
                        data: Vec::new(),
                        readonly: false,
                    },
                );
                (0, None)
            }
            OpenMode::WriteAt(offset) => {
                let Some(Node::File { data, .. }) = self.nodes.get_mut(path) else {
                    return Err(StorageError::NotFound);
                };
                let pos = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                data.truncate(pos);
                (pos, None)
            }
        };

        self.next_handle += 1;
        let handle = FileHandle(self.next_handle);
        self.files.insert(
            handle,
            OpenFile {
                path: path.to_path_buf(),
                pos,
            },
        );
        Ok(CalloutOutput::Opened { handle, size })
    }

    fn enumerate(&mut self, dir: &Path, reset: bool) -> CalloutResult {
        if reset || !self.cursors.contains_key(dir) {
            if self.nodes.get(dir) != Some(&Node::Dir) {
                return Err(StorageError::NotFound);
            }
            let entries = self
                .children(dir)
                .map(|(path, node)| DirEntry {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    is_dir: *node == Node::Dir,
                    size: match node {
                        Node::File { data, .. } => data.len() as u64,
                        Node::Dir => 0,
                    },
                    modified: None,
                    user_perm: None,
                })
                .collect();
            self.cursors.insert(dir.to_path_buf(), (entries, 0));
        }

        let Some((entries, next)) = self.cursors.get_mut(dir) else {
            return Err(StorageError::NotFound);
        };
        match entries.get(*next) {
            Some(entry) => {
                *next += 1;
                Ok(CalloutOutput::Entry(entry.clone()))
            }
            None => {
                self.cursors.remove(dir);
                Ok(CalloutOutput::EndOfEntries)
            }
        }
    }

    fn rename(&mut self, from: &Path, to: &Path, copy: bool) -> CalloutResult {
        let Some(node) = self.nodes.get(from).cloned() else {
            return Err(StorageError::NotFound);
        };
        if self.nodes.contains_key(to) {
            return Err(StorageError::PermissionDenied);
        }
        if !self.parent_is_dir(to) {
            return Err(StorageError::NotFound);
        }
        if copy {
            if node == Node::Dir {
                return Err(StorageError::Unsupported);
            }
            self.nodes.insert(to.to_path_buf(), node);
            return Ok(CalloutOutput::Done);
        }

        let moved: Vec<PathBuf> = self
            .nodes
            .keys()
            .filter(|path| path.starts_with(from))
            .cloned()
            .collect();
        for path in moved {
            if let (Some(node), Ok(rest)) = (self.nodes.remove(&path), path.strip_prefix(from)) {
                let target = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                self.nodes.insert(target, node);
            }
        }
        Ok(CalloutOutput::Done)
    }

    fn parent_is_dir(&self, path: &Path) -> bool {
        path.parent()
            .is_some_and(|parent| self.nodes.get(parent) == Some(&Node::Dir))
    }

    fn children<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a Node)> + 'a {
        self.nodes
            .iter()
            .filter(move |(path, _)| path.parent() == Some(dir))
    }
}

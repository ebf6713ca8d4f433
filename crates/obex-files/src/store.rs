//! Filesystem provider state and the file/folder callouts.

use chrono::{DateTime, Utc};
use obex_core::callout::{
    AccessMode, Callout, CalloutOutput, CalloutResult, DirEntry, FileHandle, MessageEntry,
    OpenMode, StorageError, StorageRequest,
};
use obex_core::{InstanceId, PeerAddress, SessionHandle};
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Extension of persisted suspend records
const SESSION_EXT: &str = "session";

/// Open object tracked by the store
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
}

/// Storage provider backed by the local filesystem
///
/// Paths in callouts are already fully qualified by the engine. The store
/// keeps its own handle table, one directory snapshot per session and
/// listing, and a state directory for suspend records.
#[derive(Debug)]
pub struct FsStore {
    state_dir: PathBuf,
    pub(crate) roots: HashMap<InstanceId, PathBuf>,
    pub(crate) files: HashMap<FileHandle, OpenFile>,
    next_handle: u32,
    listings: HashMap<(SessionHandle, PathBuf), VecDeque<DirEntry>>,
    pub(crate) message_listings: HashMap<(SessionHandle, PathBuf), VecDeque<MessageEntry>>,
    pub(crate) next_message: u64,
}

impl FsStore {
    /// Create a store persisting suspend records under `state_dir`
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            roots: HashMap::new(),
            files: HashMap::new(),
            next_handle: 1,
            listings: HashMap::new(),
            message_listings: HashMap::new(),
            next_message: u64::from(rand::random::<u32>()),
        }
    }

    /// Register the root folder of a service instance
    ///
    /// Message handles are resolved below this root.
    #[must_use]
    pub fn with_instance(mut self, id: InstanceId, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(id, root.into());
        self
    }

    /// Number of open handles
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.files.len()
    }

    /// Execute one storage request
    pub async fn execute(&mut self, request: &StorageRequest) -> CalloutResult {
        tracing::debug!(
            "{} {} {}",
            request.session,
            request.callout.name(),
            request.token.map_or_else(|| "detached".to_string(), |t| t.to_string())
        );
        match &request.callout {
            Callout::Open {
                path,
                mode,
                size_hint,
            } => self.open(path, *mode, *size_hint).await,
            Callout::Read { handle, max_len } => self.read(*handle, *max_len).await,
            Callout::Write { handle, data } => self.write(*handle, data).await,
            Callout::Close { handle } => self.close(*handle).await,
            Callout::Seek { handle, offset } => {
                let file = self.file_mut(*handle)?;
                file.file.seek(SeekFrom::Start(*offset)).await?;
                Ok(CalloutOutput::Done)
            }
            Callout::Enumerate { dir, reset } => {
                self.enumerate(request.session, dir, *reset).await
            }
            Callout::Access { path, mode } => access(path, *mode).await,
            Callout::Mkdir { path } => {
                fs::create_dir(path).await?;
                Ok(CalloutOutput::Done)
            }
            Callout::Rmdir { path } => {
                fs::remove_dir(path).await?;
                Ok(CalloutOutput::Done)
            }
            Callout::Unlink { path } => {
                fs::remove_file(path).await?;
                Ok(CalloutOutput::Done)
            }
            Callout::Rename { from, to, copy } => rename(from, to, *copy).await,
            Callout::Chmod { path, permissions } => chmod(path, *permissions).await,
            Callout::SaveSession { peer, record } => {
                fs::create_dir_all(&self.state_dir).await?;
                fs::write(self.record_path(*peer), record).await?;
                Ok(CalloutOutput::Done)
            }
            Callout::LoadSession { peer } => {
                let bytes = fs::read(self.record_path(*peer)).await?;
                Ok(CalloutOutput::SessionRecord(bytes))
            }
            Callout::OpenMessage { handle, .. } => {
                self.open_message(request.instance, handle).await
            }
            Callout::PushMessage { folder, .. } => self.push_message(folder).await,
            Callout::MessageListNext {
                folder,
                reset,
                filter,
            } => {
                self.message_list_next(request.session, folder, *reset, filter)
                    .await
            }
            Callout::SetMessageStatus {
                handle,
                indicator,
                value,
            } => {
                self.set_message_status(request.instance, handle, *indicator, *value)
                    .await
            }
            Callout::UpdateInbox => Ok(CalloutOutput::Done),
        }
    }

    pub(crate) fn insert_file(&mut self, file: File, path: PathBuf) -> FileHandle {
        let handle = FileHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.files.insert(handle, OpenFile { file, path });
        handle
    }

    fn file_mut(&mut self, handle: FileHandle) -> Result<&mut OpenFile, StorageError> {
        self.files.get_mut(&handle).ok_or(StorageError::NotFound)
    }

    fn record_path(&self, peer: PeerAddress) -> PathBuf {
        self.state_dir
            .join(hex::encode(peer.0))
            .with_extension(SESSION_EXT)
    }

    async fn open(&mut self, path: &Path, mode: OpenMode, size_hint: Option<u64>) -> CalloutResult {
        let (file, size) = match mode {
            OpenMode::Read | OpenMode::ReadAt(_) => {
                let meta = fs::metadata(path).await?;
                if meta.is_dir() {
                    return Err(StorageError::NotFound);
                }
                let mut file = File::open(path).await?;
                if let OpenMode::ReadAt(offset) = mode {
                    file.seek(SeekFrom::Start(offset)).await?;
                }
                (file, Some(meta.len()))
            }
            OpenMode::Create => {
                let file = File::create(path).await?;
                if let Some(hint) = size_hint {
                    tracing::trace!("creating {} for {} bytes", path.display(), hint);
                }
                (file, None)
            }
            OpenMode::WriteAt(offset) => {
                let mut file = OpenOptions::new().write(true).open(path).await?;
                file.set_len(offset).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                (file, Some(offset))
            }
        };
        let handle = self.insert_file(file, path.to_path_buf());
        Ok(CalloutOutput::Opened { handle, size })
    }

    async fn read(&mut self, handle: FileHandle, max_len: usize) -> CalloutResult {
        let open = self.file_mut(handle)?;
        let mut bytes = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            let n = open.file.read(&mut bytes[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        bytes.truncate(filled);
        Ok(CalloutOutput::Data {
            eof: filled < max_len,
            bytes,
        })
    }

    async fn write(&mut self, handle: FileHandle, data: &[u8]) -> CalloutResult {
        let open = self.file_mut(handle)?;
        open.file.write_all(data).await?;
        Ok(CalloutOutput::Written { len: data.len() })
    }

    async fn close(&mut self, handle: FileHandle) -> CalloutResult {
        let mut open = self.files.remove(&handle).ok_or(StorageError::NotFound)?;
        open.file.flush().await?;
        tracing::trace!("closed {}", open.path.display());
        Ok(CalloutOutput::Done)
    }

    async fn enumerate(&mut self, session: SessionHandle, dir: &Path, reset: bool) -> CalloutResult {
        let key = (session, dir.to_path_buf());
        if reset || !self.listings.contains_key(&key) {
            self.listings.retain(|(s, _), _| *s != session);
            let snapshot = snapshot_dir(dir).await?;
            self.listings.insert(key.clone(), snapshot);
        }
        match self.listings.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(entry) => Ok(CalloutOutput::Entry(entry)),
            None => {
                self.listings.remove(&key);
                Ok(CalloutOutput::EndOfEntries)
            }
        }
    }
}

/// Format a modification time the way folder listings carry it
pub(crate) fn listing_time(time: std::time::SystemTime) -> String {
    DateTime::<Utc>::from(time).format("%Y%m%dT%H%M%SZ").to_string()
}

async fn snapshot_dir(dir: &Path) -> Result<VecDeque<DirEntry>, StorageError> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(item) = read_dir.next_entry().await? {
        let meta = item.metadata().await?;
        entries.push(DirEntry {
            name: item.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok().map(listing_time),
            user_perm: Some(if meta.permissions().readonly() { "R" } else { "RWD" }.to_string()),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries.into())
}

async fn access(path: &Path, mode: AccessMode) -> CalloutResult {
    let meta = fs::metadata(path).await?;
    if mode == AccessMode::Write && meta.permissions().readonly() {
        return Err(StorageError::PermissionDenied);
    }
    Ok(CalloutOutput::Access {
        is_dir: meta.is_dir(),
    })
}

async fn rename(from: &Path, to: &Path, copy: bool) -> CalloutResult {
    let meta = fs::metadata(from).await?;
    if fs::try_exists(to).await? {
        return Err(StorageError::PermissionDenied);
    }
    if copy {
        if meta.is_dir() {
            return Err(StorageError::Unsupported);
        }
        fs::copy(from, to).await?;
    } else {
        fs::rename(from, to).await?;
    }
    Ok(CalloutOutput::Done)
}

/// Apply OBEX permission bits (user, group, other bytes; bit 0 read,
/// bit 1 write, bit 2 delete)
async fn chmod(path: &Path, permissions: u32) -> CalloutResult {
    let mut perms = fs::metadata(path).await?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(unix_mode(permissions));
    }
    #[cfg(not(unix))]
    {
        perms.set_readonly((permissions >> 16) & 0x02 == 0);
    }
    fs::set_permissions(path, perms).await?;
    Ok(CalloutOutput::Done)
}

#[cfg_attr(not(unix), allow(dead_code))]
pub(crate) fn unix_mode(permissions: u32) -> u32 {
    let class = |byte: u32| {
        let mut bits = 0;
        if byte & 0x01 != 0 {
            bits |= 0o4;
        }
        if byte & 0x06 != 0 {
            bits |= 0o2;
        }
        bits
    };
    let user = class((permissions >> 16) & 0xFF);
    let group = class((permissions >> 8) & 0xFF);
    let other = class(permissions & 0xFF);
    (user << 6) | (group << 3) | other
}

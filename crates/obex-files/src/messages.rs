//! Message store on disk.
//!
//! Each MAP folder is a directory. A message is a pair of files named by its
//! handle: `<handle>.bmsg` holds the message object exactly as pushed or
//! delivered, `<handle>.json` holds the listing metadata. Charset and
//! attachment requests are not applied; objects are served as stored.

use crate::store::{FsStore, listing_time};
use obex_core::callout::{
    CalloutOutput, CalloutResult, ListingFilter, MessageEntry, MessageHandle, StatusIndicator,
    StorageError,
};
use obex_core::{InstanceId, SessionHandle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};

/// Message object extension
pub const MESSAGE_EXT: &str = "bmsg";
/// Metadata extension
pub const META_EXT: &str = "json";

/// Folder that receives messages marked deleted
const DELETED_FOLDER: &str = "deleted";
/// Folder that receives undeleted messages
const INBOX_FOLDER: &str = "inbox";

/// Listing metadata stored next to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Subject line
    pub subject: String,
    /// `YYYYMMDDTHHMMSS`
    pub datetime: String,
    /// Sender addressing
    #[serde(default)]
    pub sender: String,
    /// Recipient addressing
    #[serde(default)]
    pub recipient: String,
    /// `EMAIL`, `SMS_GSM`, `SMS_CDMA` or `MMS`
    pub kind: String,
    /// Read flag
    #[serde(default)]
    pub read: bool,
}

impl MessageMeta {
    fn type_bit(&self) -> u8 {
        match self.kind.as_str() {
            "SMS_GSM" => 0x01,
            "SMS_CDMA" => 0x02,
            "EMAIL" => 0x04,
            "MMS" => 0x08,
            _ => 0,
        }
    }

    fn matches(&self, filter: &ListingFilter) -> bool {
        if filter.message_type.is_some_and(|mask| mask & self.type_bit() != 0) {
            return false;
        }
        match filter.read_status {
            Some(1) => !self.read,
            Some(2) => self.read,
            _ => true,
        }
    }
}

/// Write a message and its metadata into `folder`
///
/// Used to seed a store; returns the path of the message object.
pub async fn store_message(
    folder: &Path,
    handle: &MessageHandle,
    meta: &MessageMeta,
    object: &[u8],
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(folder).await?;
    let object_path = folder.join(&handle.0).with_extension(MESSAGE_EXT);
    fs::write(&object_path, object).await?;
    let json = serde_json::to_vec_pretty(meta).map_err(std::io::Error::other)?;
    fs::write(folder.join(&handle.0).with_extension(META_EXT), json).await?;
    Ok(object_path)
}

impl FsStore {
    pub(crate) async fn open_message(
        &mut self,
        instance: InstanceId,
        handle: &MessageHandle,
    ) -> CalloutResult {
        let object = self.find_message(instance, handle).await?;
        let size = fs::metadata(&object).await?.len();
        let file = File::open(&object).await?;
        let handle = self.insert_file(file, object);
        Ok(CalloutOutput::Opened {
            handle,
            size: Some(size),
        })
    }

    pub(crate) async fn push_message(&mut self, folder: &Path) -> CalloutResult {
        fs::create_dir_all(folder).await?;
        let message = loop {
            self.next_message = self.next_message.wrapping_add(1);
            let candidate = MessageHandle(format!("{:016X}", self.next_message));
            let path = folder.join(&candidate.0).with_extension(MESSAGE_EXT);
            if !fs::try_exists(&path).await? {
                break candidate;
            }
        };

        let meta = MessageMeta {
            subject: String::new(),
            datetime: message_time(std::time::SystemTime::now()),
            sender: String::new(),
            recipient: String::new(),
            kind: "EMAIL".to_string(),
            read: true,
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| StorageError::Io(e.to_string()))?;
        fs::write(folder.join(&message.0).with_extension(META_EXT), json).await?;

        let object = folder.join(&message.0).with_extension(MESSAGE_EXT);
        let file = File::create(&object).await?;
        let handle = self.insert_file(file, object);
        tracing::debug!("pushed message {} into {}", message, folder.display());
        Ok(CalloutOutput::MessageCreated { handle, message })
    }

    pub(crate) async fn message_list_next(
        &mut self,
        session: SessionHandle,
        folder: &Path,
        reset: bool,
        filter: &ListingFilter,
    ) -> CalloutResult {
        let key = (session, folder.to_path_buf());
        if reset || !self.message_listings.contains_key(&key) {
            self.message_listings.retain(|(s, _), _| *s != session);
            let snapshot = snapshot_messages(folder, filter).await?;
            self.message_listings.insert(key.clone(), snapshot);
        }
        match self.message_listings.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(entry) => Ok(CalloutOutput::Message(entry)),
            None => {
                self.message_listings.remove(&key);
                Ok(CalloutOutput::EndOfEntries)
            }
        }
    }

    pub(crate) async fn set_message_status(
        &mut self,
        instance: InstanceId,
        handle: &MessageHandle,
        indicator: StatusIndicator,
        value: bool,
    ) -> CalloutResult {
        let object = self.find_message(instance, handle).await?;
        let meta_path = object.with_extension(META_EXT);
        match indicator {
            StatusIndicator::Read => {
                let mut meta = read_meta(&meta_path).await?;
                meta.read = value;
                let json =
                    serde_json::to_vec_pretty(&meta).map_err(|e| StorageError::Io(e.to_string()))?;
                fs::write(&meta_path, json).await?;
            }
            StatusIndicator::Deleted => {
                let target = if value { DELETED_FOLDER } else { INBOX_FOLDER };
                let folder = object
                    .parent()
                    .and_then(Path::parent)
                    .ok_or(StorageError::NotFound)?
                    .join(target);
                if object.parent() != Some(folder.as_path()) {
                    fs::create_dir_all(&folder).await?;
                    fs::rename(&object, folder.join(&handle.0).with_extension(MESSAGE_EXT)).await?;
                    fs::rename(&meta_path, folder.join(&handle.0).with_extension(META_EXT)).await?;
                }
            }
        }
        Ok(CalloutOutput::Done)
    }

    /// Locate `<handle>.bmsg` anywhere below the instance root
    async fn find_message(
        &self,
        instance: InstanceId,
        handle: &MessageHandle,
    ) -> Result<PathBuf, StorageError> {
        let root = self.roots.get(&instance).ok_or(StorageError::NotFound)?;
        let wanted = format!("{}.{}", handle.0, MESSAGE_EXT);
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir).await?;
            while let Some(item) = read_dir.next_entry().await? {
                let kind = item.file_type().await?;
                if kind.is_dir() {
                    pending.push(item.path());
                } else if item.file_name().to_string_lossy().eq_ignore_ascii_case(&wanted) {
                    return Ok(item.path());
                }
            }
        }
        Err(StorageError::NotFound)
    }
}

async fn read_meta(path: &Path) -> Result<MessageMeta, StorageError> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Io(format!("{}: {e}", path.display())))
}

async fn snapshot_messages(
    folder: &Path,
    filter: &ListingFilter,
) -> Result<VecDeque<MessageEntry>, StorageError> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(folder).await?;
    while let Some(item) = read_dir.next_entry().await? {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
            continue;
        }
        let Some(handle) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let meta = match read_meta(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("skipping message {}: {}", handle, e);
                continue;
            }
        };
        if !meta.matches(filter) {
            continue;
        }
        let object = path.with_extension(MESSAGE_EXT);
        let size = match fs::metadata(&object).await {
            Ok(m) => m.len(),
            Err(_) => continue,
        };
        entries.push(entry_from(handle, meta, size, filter.subject_length));
    }

    // Newest first
    entries.sort_by(|a, b| b.datetime.cmp(&a.datetime));
    let limit = match filter.max_count {
        Some(0) | None => usize::MAX,
        Some(n) => usize::from(n),
    };
    Ok(entries
        .into_iter()
        .skip(usize::from(filter.start_offset))
        .take(limit)
        .collect())
}

fn entry_from(handle: String, meta: MessageMeta, size: u64, subject_length: Option<u8>) -> MessageEntry {
    let subject = match subject_length {
        Some(max) => meta.subject.chars().take(usize::from(max)).collect(),
        None => meta.subject,
    };
    MessageEntry {
        handle: MessageHandle(handle),
        subject,
        datetime: meta.datetime,
        sender: meta.sender,
        recipient: meta.recipient,
        kind: meta.kind,
        size,
        read: meta.read,
    }
}

/// Message listing timestamp (no zone designator)
pub(crate) fn message_time(time: std::time::SystemTime) -> String {
    let mut stamp = listing_time(time);
    stamp.pop();
    stamp
}

//! Engine and service-instance configuration

use crate::error::EngineError;
use crate::packet::{MAX_PACKET_LEN, RESPONSE_OVERHEAD};
use crate::registry::InstanceId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest packet the server accepts; the negotiated length is the
    /// minimum of this and the peer's value
    pub max_packet_len: u16,

    /// How long the application may take to answer an access request.
    /// `None` waits forever.
    pub access_timeout: Option<Duration>,

    /// OBEX authentication
    pub auth: AuthConfig,

    /// Notification client
    pub notify: NotifyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_len: 0x7FFF,
            access_timeout: Some(Duration::from_secs(30)),
            auth: AuthConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` if the packet length cannot carry
    /// a body byte.
    pub fn validate(&self) -> Result<(), EngineError> {
        if usize::from(self.max_packet_len) <= RESPONSE_OVERHEAD {
            return Err(EngineError::InvalidConfig(format!(
                "max_packet_len {} must exceed {} bytes of response overhead",
                self.max_packet_len, RESPONSE_OVERHEAD
            )));
        }
        Ok(())
    }
}

/// OBEX authentication configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Challenge every connecting client
    pub required: bool,
    /// Client must send a user id
    pub user_id_required: bool,
    /// Realm shown to the user
    pub realm: Option<String>,
}

/// Notification client configuration
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// How long to wait for the notification server to answer a request
    pub response_timeout: Duration,
    /// Largest packet the client accepts
    pub max_packet_len: u16,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

/// Profile served by a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// OBEX File Transfer
    FileTransfer,
    /// Message Access
    MessageAccess,
}

/// Object kinds a service instance offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// Plain files (get/put/delete/actions)
    Files,
    /// Folder listings
    FolderListing,
    /// Message objects (get)
    Messages,
    /// Message listings
    MessageListing,
    /// Message push, status and inbox update
    MessageUpdate,
    /// Notification registration
    Notifications,
}

impl Profile {
    /// Object kinds offered by default
    #[must_use]
    pub fn default_kinds(self) -> Vec<ObjectKind> {
        match self {
            Self::FileTransfer => vec![ObjectKind::Files, ObjectKind::FolderListing],
            Self::MessageAccess => vec![
                ObjectKind::FolderListing,
                ObjectKind::Messages,
                ObjectKind::MessageListing,
                ObjectKind::MessageUpdate,
                ObjectKind::Notifications,
            ],
        }
    }

    /// Target UUID clients connect to
    #[must_use]
    pub fn target(self) -> &'static [u8; 16] {
        match self {
            Self::FileTransfer => &crate::packet::TARGET_FOLDER_BROWSING,
            Self::MessageAccess => &crate::packet::TARGET_MESSAGE_ACCESS,
        }
    }
}

/// One published service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance id (MAS instance id for message access)
    pub id: InstanceId,
    /// Served profile
    pub profile: Profile,
    /// Human readable service name
    pub name: String,
    /// Root folder of the store
    pub root: PathBuf,
    /// Offered object kinds
    pub kinds: Vec<ObjectKind>,
    /// Concurrent sessions
    pub max_sessions: usize,
}

impl InstanceConfig {
    /// File transfer service rooted at `root`
    #[must_use]
    pub fn file_transfer(root: impl Into<PathBuf>) -> Self {
        Self {
            id: InstanceId(0),
            profile: Profile::FileTransfer,
            name: "OBEX File Transfer".to_string(),
            root: root.into(),
            kinds: Profile::FileTransfer.default_kinds(),
            max_sessions: 1,
        }
    }

    /// Message access instance `id` rooted at `root`
    #[must_use]
    pub fn message_access(id: u8, root: impl Into<PathBuf>, max_sessions: usize) -> Self {
        Self {
            id: InstanceId(id),
            profile: Profile::MessageAccess,
            name: format!("MAP MAS {id}"),
            root: root.into(),
            kinds: Profile::MessageAccess.default_kinds(),
            max_sessions,
        }
    }

    /// Whether the instance offers `kind`
    #[must_use]
    pub fn offers(&self, kind: ObjectKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` for an empty root, a zero session
    /// pool or a multi-session file transfer instance.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.root.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "instance {} has an empty root",
                self.id
            )));
        }
        if self.max_sessions == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "instance {} needs at least one session",
                self.id
            )));
        }
        if self.profile == Profile::FileTransfer && self.max_sessions != 1 {
            return Err(EngineError::InvalidConfig(
                "file transfer serves a single session".to_string(),
            ));
        }
        Ok(())
    }
}

//! Platform notification facility.
//!
//! The controller talks to notifications through [`Notifier`]: a capability
//! probe, a permission query, an asynchronous permission request and a
//! display action. [`DesktopNotifier`] is the real implementation.

mod desktop;

use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use thiserror::Error;

pub use desktop::{parse_answer, DesktopNotifier, PERMISSION_KEY};

/// Tag shared by every notification this crate shows; a new notification
/// replaces the previous one instead of stacking.
pub const NOTIFICATION_TAG: &str = "adobe-digest";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notifications are not supported on this system")]
    Unsupported,
    #[error("Notification permission has not been granted")]
    PermissionDenied,
    #[error("Permission prompt failed: {0}")]
    Prompt(String),
    #[error("Failed to display notification: {0}")]
    Display(String),
}

/// Permission state of the notification facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Unsupported,
    Default,
    Granted,
    Denied,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Unsupported => "unsupported",
            Permission::Default => "default",
            Permission::Granted => "granted",
            Permission::Denied => "denied",
        }
    }

    /// Parses a stored decision. Only decided states are ever stored.
    pub fn from_stored(value: &str) -> Option<Self> {
        match value.trim() {
            "granted" => Some(Permission::Granted),
            "denied" => Some(Permission::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to display one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub tag: String,
    pub require_interaction: bool,
    pub silent: bool,
    /// Opened in the browser when the notification is clicked.
    pub url: Option<String>,
}

impl NotificationRequest {
    pub fn new(title: impl Into<String>, body: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            icon: icon.into(),
            tag: NOTIFICATION_TAG.to_string(),
            require_interaction: false,
            silent: false,
            url: None,
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }
}

/// Identifies a displayed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationHandle {
    /// Platform id derived from the tag; equal tags share an id.
    pub id: u32,
    pub tag: String,
    pub title: String,
    pub url: Option<String>,
}

impl NotificationHandle {
    pub fn for_request(request: &NotificationRequest) -> Self {
        Self {
            id: tag_id(&request.tag),
            tag: request.tag.clone(),
            title: request.title.clone(),
            url: request.url.clone(),
        }
    }
}

/// Stable non-zero notification id for a tag (0 means "allocate a new one"
/// to notification servers).
pub fn tag_id(tag: &str) -> u32 {
    let hash = Sha256::digest(tag.as_bytes());
    let id = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    id.max(1)
}

pub trait Notifier: Send + Sync + 'static {
    /// Whether the platform can show notifications at all.
    fn is_supported(&self) -> bool;

    /// Current permission; `Unsupported` when [`Notifier::is_supported`] is false.
    fn permission(&self) -> Permission;

    /// Asks the user for permission. Resolves immediately when a decision
    /// already exists.
    fn request_permission(&self) -> impl Future<Output = Result<Permission, NotifyError>> + Send;

    /// Displays a notification.
    fn show(&self, request: &NotificationRequest) -> Result<NotificationHandle, NotifyError>;
}

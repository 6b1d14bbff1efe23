use notify_rust::{Notification, Timeout};
use std::io::{BufRead, IsTerminal, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{NotificationHandle, NotificationRequest, Notifier, NotifyError, Permission};
use crate::storage::SettingsStore;
use crate::util::validate_url_for_open;

/// Storage key for the user's permission decision (`granted` / `denied`).
pub const PERMISSION_KEY: &str = "notificationPermission";

/// Set to a non-empty value other than `0` to report notifications as
/// unsupported (headless machines, CI).
const DISABLE_ENV: &str = "DIGEST_NOTIFY_DISABLE";

type PromptFn = dyn Fn(&str) -> std::io::Result<String> + Send + Sync;

/// Desktop notifications through the system notification service.
///
/// There is no OS-level permission prompt for desktop notifications, so the
/// permission lives in the state store: `default` until the user answers the
/// terminal prompt, then `granted` or `denied` until revoked.
pub struct DesktopNotifier<S> {
    store: S,
    app_name: String,
    supported: bool,
    permission: Mutex<Permission>,
    prompt: Arc<PromptFn>,
    /// Bumped on every show; see [`ClickTarget`].
    latest_shown: Arc<AtomicU64>,
}

/// Click URL of one shown notification.
///
/// All notifications share one id, so a click on the current notification
/// also reaches actions still waiting on the ones it replaced. Only the most
/// recently shown target opens its link.
struct ClickTarget {
    url: String,
    generation: u64,
    latest_shown: Arc<AtomicU64>,
}

impl ClickTarget {
    #[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
    fn url_if_current(&self) -> Option<&str> {
        (self.latest_shown.load(Ordering::SeqCst) == self.generation).then_some(self.url.as_str())
    }
}

impl<S: SettingsStore> DesktopNotifier<S> {
    /// Builds the notifier and loads the stored permission decision.
    ///
    /// A missing, unreadable or unrecognised decision means `default`.
    pub async fn load(store: S, app_name: impl Into<String>) -> Self {
        let permission = match store.get(PERMISSION_KEY).await {
            Ok(Some(value)) => Permission::from_stored(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "Unrecognised stored notification permission, treating as default");
                Permission::Default
            }),
            Ok(None) => Permission::Default,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read notification permission");
                Permission::Default
            }
        };

        Self {
            store,
            app_name: app_name.into(),
            supported: platform_supported() && !disabled_by_env(),
            permission: Mutex::new(permission),
            prompt: Arc::new(terminal_prompt),
            latest_shown: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Overrides platform detection.
    pub fn with_support(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    /// Replaces the terminal prompt. The closure receives the question and
    /// returns the user's raw answer.
    pub fn with_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&str) -> std::io::Result<String> + Send + Sync + 'static,
    {
        self.prompt = Arc::new(prompt);
        self
    }

    /// Forgets the stored decision so the next request prompts again.
    pub async fn revoke(&self) -> anyhow::Result<()> {
        self.store.remove(PERMISSION_KEY).await?;
        self.set_cached(Permission::Default);
        tracing::info!("Notification permission reset to default");
        Ok(())
    }

    fn cached(&self) -> Permission {
        *self.permission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_cached(&self, permission: Permission) {
        *self.permission.lock().unwrap_or_else(PoisonError::into_inner) = permission;
    }

    async fn record(&self, permission: Permission) {
        self.set_cached(permission);
        if let Err(e) = self.store.set(PERMISSION_KEY, permission.as_str()).await {
            tracing::warn!(error = %e, permission = %permission, "Failed to persist notification permission");
        }
    }

    /// Marks a new notification as the current one.
    fn click_target(&self, url: Option<String>) -> Option<ClickTarget> {
        let generation = self.latest_shown.fetch_add(1, Ordering::SeqCst) + 1;
        url.map(|url| ClickTarget {
            url,
            generation,
            latest_shown: Arc::clone(&self.latest_shown),
        })
    }

    fn build(&self, request: &NotificationRequest, id: u32) -> Notification {
        let mut notification = Notification::new();
        notification
            .appname(&self.app_name)
            .summary(&request.title)
            .body(&request.body)
            .icon(&request.icon);

        if request.require_interaction {
            notification.timeout(Timeout::Never);
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        {
            use notify_rust::Hint;

            // Same id replaces the previous notification on the server
            notification.id(id).hint(Hint::SuppressSound(request.silent));
            if request.url.is_some() {
                notification.action("default", "Open");
            }
        }
        #[cfg(not(all(unix, not(target_os = "macos"))))]
        let _ = id;

        notification
    }
}

impl<S: SettingsStore> Notifier for DesktopNotifier<S> {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn permission(&self) -> Permission {
        if !self.supported {
            return Permission::Unsupported;
        }
        self.cached()
    }

    async fn request_permission(&self) -> Result<Permission, NotifyError> {
        match self.permission() {
            Permission::Unsupported => return Err(NotifyError::Unsupported),
            Permission::Default => {}
            decided => return Ok(decided),
        }

        let question = format!("Allow desktop notifications from {}? [y/N] ", self.app_name);
        let prompt = Arc::clone(&self.prompt);
        let answer = tokio::task::spawn_blocking(move || prompt(&question))
            .await
            .map_err(|e| NotifyError::Prompt(e.to_string()))?
            .map_err(|e| NotifyError::Prompt(e.to_string()))?;

        let decision = parse_answer(&answer);
        self.record(decision).await;
        Ok(decision)
    }

    fn show(&self, request: &NotificationRequest) -> Result<NotificationHandle, NotifyError> {
        match self.permission() {
            Permission::Granted => {}
            Permission::Unsupported => return Err(NotifyError::Unsupported),
            Permission::Default | Permission::Denied => return Err(NotifyError::PermissionDenied),
        }

        let handle = NotificationHandle::for_request(request);
        let target = self.click_target(request.url.clone());
        display(self.build(request, handle.id), target)?;
        tracing::debug!(id = handle.id, title = %handle.title, "Notification shown");
        Ok(handle)
    }
}

/// `y` / `yes` (any case) grants; anything else denies.
pub fn parse_answer(answer: &str) -> Permission {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Permission::Granted,
        _ => Permission::Denied,
    }
}

fn terminal_prompt(question: &str) -> std::io::Result<String> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Err(std::io::Error::other("stdin is not a terminal"));
    }

    let mut stderr = std::io::stderr();
    stderr.write_all(question.as_bytes())?;
    stderr.flush()?;

    let mut line = String::new();
    if stdin.lock().read_line(&mut line)? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "no answer given",
        ));
    }
    Ok(line)
}

fn platform_supported() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
        target_os = "macos",
        target_os = "windows"
    ))
}

fn disabled_by_env() -> bool {
    std::env::var(DISABLE_ENV)
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

/// Shows the notification. On freedesktop systems a click URL keeps a thread
/// waiting for the action; the show result is reported back before it waits.
/// The thread ends with the process, so a one-shot run cannot open links.
#[cfg(all(unix, not(target_os = "macos")))]
fn display(notification: Notification, target: Option<ClickTarget>) -> Result<(), NotifyError> {
    let Some(target) = target else {
        return notification
            .show()
            .map(|_| ())
            .map_err(|e| NotifyError::Display(e.to_string()));
    };

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || match notification.show() {
        Ok(handle) => {
            let _ = tx.send(Ok(()));
            handle.wait_for_action(|action| {
                if action != "default" && action != "clicked" {
                    return;
                }
                match target.url_if_current() {
                    Some(url) => open_in_browser(url),
                    None => tracing::debug!(url = %target.url, "Ignoring click on a replaced notification"),
                }
            });
        }
        Err(e) => {
            let _ = tx.send(Err(e.to_string()));
        }
    });

    rx.recv()
        .map_err(|e| NotifyError::Display(e.to_string()))?
        .map_err(NotifyError::Display)
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
fn display(notification: Notification, target: Option<ClickTarget>) -> Result<(), NotifyError> {
    if let Some(target) = target {
        tracing::debug!(url = %target.url, "Click actions unavailable on this platform");
    }
    notification
        .show()
        .map(|_| ())
        .map_err(|e| NotifyError::Display(e.to_string()))
}

#[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
fn open_in_browser(url: &str) {
    // Feed content is remote input; only web URLs reach the browser
    match validate_url_for_open(url) {
        Ok(valid) => {
            if let Err(e) = open::that(valid.as_str()) {
                tracing::warn!(url = %valid, error = %e, "Failed to open browser");
            }
        }
        Err(e) => tracing::warn!(url = %url, error = %e, "Refusing to open notification link"),
    }
}

//! Notification preference controller.
//!
//! Owns the opt-in flag and the last-check checkpoint, asks for notification
//! permission, and polls the feed at most once per check interval. Nothing in
//! here returns an error: every failure is logged and the controller carries
//! on with what it has.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::feed::FeedClient;
use crate::notify::{NotificationHandle, NotificationRequest, Notifier, Permission};
use crate::storage::SettingsStore;

/// Storage key of the JSON preference record `{"enabled": bool}`.
pub const PREFERENCE_KEY: &str = "adobeDigestNotifications";
/// Storage key of the checkpoint, decimal epoch milliseconds.
pub const LAST_CHECK_KEY: &str = "adobeDigestLastCheck";
/// Minimum spacing between feed polls.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Largest shortfall of a timer tick against the stored checkpoint that still
/// counts as a full interval. Wall and monotonic clocks drift apart.
const TICK_TOLERANCE: Duration = Duration::from_secs(60);
/// Freedesktop icon name used when none is configured.
pub const DEFAULT_ICON: &str = "dialog-information";

const NEW_BULLETIN_TITLE: &str = "New Adobe Security Bulletin";
const WELCOME_TITLE: &str = "Adobe Digest Notifications Enabled";
const WELCOME_BODY: &str = "You'll receive notifications when new security bulletins are posted.";

/// In-memory view of the persisted state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub enabled: bool,
    /// Epoch milliseconds of the last successful poll.
    pub last_check: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct StoredPreference {
    #[serde(default)]
    enabled: bool,
}

/// What a single [`NotificationController::check_for_updates`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Notifications are switched off.
    Disabled,
    /// Permission is not granted.
    NotPermitted,
    /// The previous poll is more recent than the check interval.
    RateLimited,
    /// Fetch or parse failed; the checkpoint was not advanced.
    Failed,
    /// The feed has no items; the checkpoint was advanced.
    EmptyFeed,
    /// The newest item is not newer than the checkpoint.
    UpToDate,
    /// The newest item is new. `shown` is false if displaying it failed.
    NewEntry { shown: bool },
}

/// Result of the public toggle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The platform cannot show notifications; nothing changed.
    Unsupported,
    /// Notifications were on and are now off.
    Disabled,
    /// Permission granted, notifications on, periodic checks running.
    Enabled,
    /// Permission was refused or could not be obtained.
    NotGranted,
}

impl ToggleOutcome {
    /// The resulting enabled state.
    pub fn is_enabled(&self) -> bool {
        matches!(self, ToggleOutcome::Enabled)
    }
}

/// Tunables taken from configuration.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub check_interval: Duration,
    pub icon: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            check_interval: CHECK_INTERVAL,
            icon: DEFAULT_ICON.to_string(),
        }
    }
}

impl From<&Config> for ControllerOptions {
    fn from(config: &Config) -> Self {
        Self {
            check_interval: config.check_interval(),
            icon: config.icon.clone(),
        }
    }
}

/// The notification preference controller.
///
/// Construct one per process and share it as `Arc<NotificationController<..>>`;
/// the periodic check task holds its own clone of that `Arc`.
pub struct NotificationController<N, S> {
    notifier: N,
    store: S,
    feed: FeedClient,
    options: ControllerOptions,
    settings: Mutex<Settings>,
    /// Serialises polls so overlapping calls never fetch twice.
    check_lock: Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<N: Notifier, S: SettingsStore> NotificationController<N, S> {
    /// Creates the controller and loads the persisted settings.
    pub async fn new(notifier: N, store: S, feed: FeedClient, options: ControllerOptions) -> Self {
        let controller = Self {
            notifier,
            store,
            feed,
            options,
            settings: Mutex::new(Settings::default()),
            check_lock: Mutex::new(()),
            timer: Mutex::new(None),
        };
        controller.load_settings().await;
        controller
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub async fn settings(&self) -> Settings {
        *self.settings.lock().await
    }

    pub async fn is_enabled(&self) -> bool {
        self.settings.lock().await.enabled
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Reads both persisted values. A value that cannot be read or parsed
    /// falls back to its default.
    pub async fn load_settings(&self) {
        let enabled = match self.store.get(PREFERENCE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<StoredPreference>(&raw) {
                Ok(stored) => stored.enabled,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse notification preference");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load notification preference");
                false
            }
        };

        let last_check = match self.store.get(LAST_CHECK_KEY).await {
            Ok(Some(raw)) => match raw.trim().parse::<i64>() {
                Ok(millis) => Some(millis),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Failed to parse last check timestamp");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load last check timestamp");
                None
            }
        };

        *self.settings.lock().await = Settings {
            enabled,
            last_check,
        };
        tracing::debug!(enabled, last_check = ?last_check, "Notification settings loaded");
    }

    /// Writes the current settings. The checkpoint is only written when set.
    pub async fn save_settings(&self) {
        let settings = self.settings().await;
        self.persist(settings).await;
    }

    async fn persist(&self, settings: Settings) {
        // The two keys are written independently; one failing does not skip the other
        match serde_json::to_string(&StoredPreference {
            enabled: settings.enabled,
        }) {
            Ok(json) => {
                if let Err(e) = self.store.set(PREFERENCE_KEY, &json).await {
                    tracing::warn!(error = %e, "Failed to save notification preference");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize notification preference"),
        }

        if let Some(millis) = settings.last_check {
            if let Err(e) = self.store.set(LAST_CHECK_KEY, &millis.to_string()).await {
                tracing::warn!(error = %e, "Failed to save last check timestamp");
            }
        }
    }

    async fn set_enabled(&self, enabled: bool) {
        let settings = {
            let mut settings = self.settings.lock().await;
            settings.enabled = enabled;
            *settings
        };
        self.persist(settings).await;
    }

    async fn record_check(&self, now: i64) {
        let settings = {
            let mut settings = self.settings.lock().await;
            settings.last_check = Some(now);
            *settings
        };
        self.persist(settings).await;
    }

    // ========================================================================
    // Permission
    // ========================================================================

    pub fn is_supported(&self) -> bool {
        self.notifier.is_supported()
    }

    pub fn permission(&self) -> Permission {
        if !self.notifier.is_supported() {
            return Permission::Unsupported;
        }
        self.notifier.permission()
    }

    /// Obtains permission and switches notifications on.
    ///
    /// An existing grant enables silently; an existing denial fails without
    /// prompting. Only a fresh grant from the prompt shows the welcome notice.
    pub async fn request_permission(&self) -> bool {
        match self.permission() {
            Permission::Unsupported => false,
            Permission::Denied => {
                tracing::debug!("Notification permission previously denied");
                false
            }
            Permission::Granted => {
                self.set_enabled(true).await;
                true
            }
            Permission::Default => match self.notifier.request_permission().await {
                Ok(Permission::Granted) => {
                    self.set_enabled(true).await;
                    self.show_welcome_notification();
                    true
                }
                Ok(permission) => {
                    tracing::info!(permission = %permission, "Notification permission not granted");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to request notification permission");
                    false
                }
            },
        }
    }

    /// Switches notifications off and stops periodic checks. Platform
    /// permission is left alone.
    pub async fn disable(&self) {
        self.set_enabled(false).await;
        self.stop_periodic_checks().await;
        tracing::info!("Notifications disabled");
    }

    // ========================================================================
    // Display
    // ========================================================================

    fn show_welcome_notification(&self) {
        self.show_notification(WELCOME_TITLE, WELCOME_BODY, &self.options.icon, None);
    }

    /// Shows a notification under the shared tag. `url` is opened when the
    /// notification is clicked.
    pub fn show_notification(
        &self,
        title: &str,
        body: &str,
        icon: &str,
        url: Option<&str>,
    ) -> Option<NotificationHandle> {
        if self.permission() != Permission::Granted {
            return None;
        }

        let request = NotificationRequest::new(title, body, icon).with_url(url.map(str::to_string));
        match self.notifier.show(&request) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(title = %title, error = %e, "Failed to show notification");
                None
            }
        }
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Polls the feed if enabled, permitted and not rate limited.
    pub async fn check_for_updates(&self) -> CheckOutcome {
        self.check_for_updates_at(Utc::now().timestamp_millis()).await
    }

    /// [`Self::check_for_updates`] with an explicit current time in epoch
    /// milliseconds.
    pub async fn check_for_updates_at(&self, now: i64) -> CheckOutcome {
        self.check_with_tolerance(now, Duration::ZERO).await
    }

    /// Runs a check that treats an elapsed time within `tolerance` of the
    /// check interval as a full interval.
    async fn check_with_tolerance(&self, now: i64, tolerance: Duration) -> CheckOutcome {
        let _serial = self.check_lock.lock().await;
        let settings = self.settings().await;

        if !settings.enabled {
            return CheckOutcome::Disabled;
        }
        if self.permission() != Permission::Granted {
            return CheckOutcome::NotPermitted;
        }

        let required = self.options.check_interval.saturating_sub(tolerance);
        let interval_millis = i64::try_from(required.as_millis()).unwrap_or(i64::MAX);
        if let Some(last) = settings.last_check {
            if now.saturating_sub(last) < interval_millis {
                tracing::debug!(last_check = last, now, "Skipping check, polled recently");
                return CheckOutcome::RateLimited;
            }
        }

        let snapshot = match self.feed.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Checkpoint stays put; the next eligible check retries
                tracing::error!(feed = %self.feed.url(), error = %e, "Failed to check for updates");
                return CheckOutcome::Failed;
            }
        };

        let outcome = match snapshot.newest() {
            None => CheckOutcome::EmptyFeed,
            Some(item) => {
                let is_new = settings
                    .last_check
                    .map_or(true, |last| item.published_millis() > last);
                if is_new {
                    tracing::info!(title = %item.title, url = %item.url, "New bulletin published");
                    let shown = self
                        .show_notification(
                            NEW_BULLETIN_TITLE,
                            &item.notification_body(),
                            &self.options.icon,
                            Some(&item.url),
                        )
                        .is_some();
                    CheckOutcome::NewEntry { shown }
                } else {
                    CheckOutcome::UpToDate
                }
            }
        };

        self.record_check(now).await;
        outcome
    }

    // ========================================================================
    // Periodic checks
    // ========================================================================

    /// Runs one check now and then one per check interval, until
    /// [`Self::stop_periodic_checks`] or [`Self::disable`].
    ///
    /// Returns `true` if a timer was armed. Does nothing when disabled or when
    /// a timer is already running.
    pub async fn start_periodic_checks(self: &Arc<Self>) -> bool {
        if !self.is_enabled().await {
            return false;
        }

        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Periodic checks already running");
            return false;
        }

        let controller = Arc::clone(self);
        let period = self.options.check_interval;
        let tolerance = TICK_TOLERANCE.min(period / 10);
        *timer = Some(tokio::spawn(async move {
            // First tick completes immediately
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = controller
                    .check_with_tolerance(Utc::now().timestamp_millis(), tolerance)
                    .await;
                tracing::debug!(outcome = ?outcome, "Periodic check finished");
            }
        }));

        tracing::info!(interval_secs = period.as_secs(), "Periodic checks started");
        true
    }

    /// Cancels the periodic check task. Returns `true` if one was running.
    pub async fn stop_periodic_checks(&self) -> bool {
        match self.timer.lock().await.take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                if was_running {
                    tracing::info!("Periodic checks stopped");
                }
                was_running
            }
            None => false,
        }
    }

    pub async fn periodic_checks_active(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // ========================================================================
    // Toggle
    // ========================================================================

    /// The public toggle action behind the UI control.
    pub async fn toggle(self: &Arc<Self>) -> ToggleOutcome {
        if !self.is_supported() {
            return ToggleOutcome::Unsupported;
        }

        if self.is_enabled().await {
            self.disable().await;
            return ToggleOutcome::Disabled;
        }

        if self.request_permission().await {
            self.start_periodic_checks().await;
            ToggleOutcome::Enabled
        } else {
            ToggleOutcome::NotGranted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use crate::storage::Database;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HOUR_MS: i64 = 60 * 60 * 1000;
    const NOW: i64 = 1_704_819_600_000; // 2024-01-09T17:00:00Z

    // ------------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------------

    struct FakeNotifier {
        supported: bool,
        permission: std::sync::Mutex<Permission>,
        /// Outcome of the prompt; `None` simulates a prompt error.
        prompt_answer: Option<Permission>,
        prompts: AtomicUsize,
        fail_show: bool,
        shown: std::sync::Mutex<Vec<NotificationRequest>>,
    }

    impl FakeNotifier {
        fn new(permission: Permission) -> Self {
            Self {
                supported: true,
                permission: std::sync::Mutex::new(permission),
                prompt_answer: Some(Permission::Granted),
                prompts: AtomicUsize::new(0),
                fail_show: false,
                shown: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn granted() -> Self {
            Self::new(Permission::Granted)
        }

        fn answering(mut self, answer: Option<Permission>) -> Self {
            self.prompt_answer = answer;
            self
        }

        fn shown(&self) -> Vec<NotificationRequest> {
            self.shown.lock().unwrap().clone()
        }

        fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    impl Notifier for FakeNotifier {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn permission(&self) -> Permission {
            *self.permission.lock().unwrap()
        }

        async fn request_permission(&self) -> Result<Permission, NotifyError> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            match self.prompt_answer {
                Some(answer) => {
                    *self.permission.lock().unwrap() = answer;
                    Ok(answer)
                }
                None => Err(NotifyError::Prompt("prompt dismissed".into())),
            }
        }

        fn show(&self, request: &NotificationRequest) -> Result<NotificationHandle, NotifyError> {
            if self.fail_show {
                return Err(NotifyError::Display("no notification server".into()));
            }
            self.shown.lock().unwrap().push(request.clone());
            Ok(NotificationHandle::for_request(request))
        }
    }

    /// Store whose writes to one key always fail.
    struct FailingKeyStore {
        inner: Database,
        failing_key: &'static str,
    }

    impl SettingsStore for FailingKeyStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get_preference(key).await
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if key == self.failing_key {
                anyhow::bail!("quota exceeded");
            }
            self.inner.set_preference(key, value).await
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete_preference(key).await
        }
    }

    /// Store where every operation fails.
    struct BrokenStore;

    impl SettingsStore for BrokenStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("storage unavailable")
        }

        async fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage unavailable")
        }

        async fn remove(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage unavailable")
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn feed_client(base: &str) -> FeedClient {
        let url = Url::parse(&format!("{}/feed.json", base)).unwrap();
        FeedClient::new(url, Duration::from_secs(5)).unwrap()
    }

    fn unreachable_feed() -> FeedClient {
        feed_client("http://127.0.0.1:9")
    }

    fn feed_body(items: &[(&str, &str, i64)]) -> String {
        let items: Vec<serde_json::Value> = items
            .iter()
            .map(|(title, url, published)| {
                let date = chrono::DateTime::from_timestamp_millis(*published)
                    .unwrap()
                    .to_rfc3339();
                serde_json::json!({"title": title, "url": url, "date_published": date})
            })
            .collect();
        serde_json::json!({"version": "https://jsonfeed.org/version/1.1", "items": items}).to_string()
    }

    async fn serve_feed(body: String, expected_hits: impl Into<wiremock::Times>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(expected_hits)
            .mount(&server)
            .await;
        server
    }

    async fn db_with(enabled: bool, last_check: Option<i64>) -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.set_preference(PREFERENCE_KEY, &format!(r#"{{"enabled":{}}}"#, enabled))
            .await
            .unwrap();
        if let Some(millis) = last_check {
            db.set_preference(LAST_CHECK_KEY, &millis.to_string())
                .await
                .unwrap();
        }
        db
    }

    async fn controller(
        notifier: FakeNotifier,
        db: Database,
        feed: FeedClient,
    ) -> NotificationController<FakeNotifier, Database> {
        NotificationController::new(notifier, db, feed, ControllerOptions::default()).await
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fresh_store_uses_defaults() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;
        assert_eq!(c.settings().await, Settings::default());
    }

    #[tokio::test]
    async fn test_load_reads_both_keys() {
        let db = db_with(true, Some(NOW)).await;
        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;
        assert_eq!(
            c.settings().await,
            Settings {
                enabled: true,
                last_check: Some(NOW)
            }
        );
    }

    #[tokio::test]
    async fn test_corrupt_values_fall_back_to_defaults() {
        let db = Database::open(":memory:").await.unwrap();
        db.set_preference(PREFERENCE_KEY, "{not json").await.unwrap();
        db.set_preference(LAST_CHECK_KEY, "yesterday").await.unwrap();

        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;
        assert_eq!(c.settings().await, Settings::default());
    }

    #[tokio::test]
    async fn test_record_without_enabled_field_is_disabled() {
        let db = Database::open(":memory:").await.unwrap();
        db.set_preference(PREFERENCE_KEY, "{}").await.unwrap();

        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;
        assert!(!c.is_enabled().await);
    }

    #[tokio::test]
    async fn test_unreadable_store_never_fails_caller() {
        let c = NotificationController::new(
            FakeNotifier::granted(),
            BrokenStore,
            unreachable_feed(),
            ControllerOptions::default(),
        )
        .await;
        assert_eq!(c.settings().await, Settings::default());

        // Writes fail and are logged; in-memory state still changes
        assert!(c.request_permission().await);
        assert!(c.is_enabled().await);
        c.disable().await;
        assert!(!c.is_enabled().await);
    }

    #[tokio::test]
    async fn test_save_skips_absent_checkpoint() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::granted(), db.clone(), unreachable_feed()).await;

        c.save_settings().await;
        assert_eq!(
            db.get_preference(PREFERENCE_KEY).await.unwrap().as_deref(),
            Some(r#"{"enabled":false}"#)
        );
        assert_eq!(db.get_preference(LAST_CHECK_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_written_when_preference_write_fails() {
        let db = Database::open(":memory:").await.unwrap();
        let store = FailingKeyStore {
            inner: db.clone(),
            failing_key: PREFERENCE_KEY,
        };
        let server = serve_feed(feed_body(&[]), 1).await;
        db.set_preference(PREFERENCE_KEY, r#"{"enabled":true}"#)
            .await
            .unwrap();

        let c = NotificationController::new(
            FakeNotifier::granted(),
            store,
            feed_client(&server.uri()),
            ControllerOptions::default(),
        )
        .await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::EmptyFeed);
        assert_eq!(
            db.get_preference(LAST_CHECK_KEY).await.unwrap(),
            Some(NOW.to_string())
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_save_load_round_trip(toggles in proptest::collection::vec(any::<bool>(), 1..6)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async move {
                let db = Database::open(":memory:").await.unwrap();
                for enabled in toggles {
                    let writer = controller(FakeNotifier::granted(), db.clone(), unreachable_feed()).await;
                    writer.set_enabled(enabled).await;

                    let reader = controller(FakeNotifier::granted(), db.clone(), unreachable_feed()).await;
                    assert_eq!(reader.is_enabled().await, enabled);
                }
            });
        }
    }

    // ------------------------------------------------------------------------
    // Permission
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_denied_fails_without_prompt() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::new(Permission::Denied), db, unreachable_feed()).await;

        assert!(!c.request_permission().await);
        assert_eq!(c.notifier().prompts(), 0);
        assert!(!c.is_enabled().await);
    }

    #[tokio::test]
    async fn test_already_granted_enables_silently() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::granted(), db.clone(), unreachable_feed()).await;

        assert!(c.request_permission().await);
        assert_eq!(c.notifier().prompts(), 0);
        assert!(c.notifier().shown().is_empty());
        assert_eq!(
            db.get_preference(PREFERENCE_KEY).await.unwrap().as_deref(),
            Some(r#"{"enabled":true}"#)
        );
    }

    #[tokio::test]
    async fn test_prompt_grant_shows_welcome() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::new(Permission::Default), db, unreachable_feed()).await;

        assert!(c.request_permission().await);
        assert_eq!(c.notifier().prompts(), 1);
        let shown = c.notifier().shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, WELCOME_TITLE);
        assert_eq!(shown[0].url, None);
    }

    #[tokio::test]
    async fn test_prompt_denial_fails() {
        let db = Database::open(":memory:").await.unwrap();
        let notifier = FakeNotifier::new(Permission::Default).answering(Some(Permission::Denied));
        let c = controller(notifier, db, unreachable_feed()).await;

        assert!(!c.request_permission().await);
        assert!(!c.is_enabled().await);
        assert!(c.notifier().shown().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_error_treated_as_denial() {
        let db = Database::open(":memory:").await.unwrap();
        let notifier = FakeNotifier::new(Permission::Default).answering(None);
        let c = controller(notifier, db, unreachable_feed()).await;

        assert!(!c.request_permission().await);
        assert!(!c.is_enabled().await);
    }

    #[tokio::test]
    async fn test_unsupported_reports_unsupported() {
        let db = Database::open(":memory:").await.unwrap();
        let mut notifier = FakeNotifier::granted();
        notifier.supported = false;
        let c = controller(notifier, db, unreachable_feed()).await;

        assert_eq!(c.permission(), Permission::Unsupported);
        assert!(!c.request_permission().await);
        assert!(c.show_notification("t", "b", DEFAULT_ICON, None).is_none());
    }

    #[tokio::test]
    async fn test_disable_keeps_platform_permission() {
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;

        c.disable().await;
        assert!(!c.is_enabled().await);
        assert_eq!(c.permission(), Permission::Granted);
    }

    // ------------------------------------------------------------------------
    // Display
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_show_notification_uses_shared_tag() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;

        let first = c
            .show_notification("a", "b", DEFAULT_ICON, Some("https://example.com/a"))
            .unwrap();
        let second = c.show_notification("c", "d", DEFAULT_ICON, None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.url.as_deref(), Some("https://example.com/a"));

        let shown = c.notifier().shown();
        assert!(shown.iter().all(|r| r.tag == crate::notify::NOTIFICATION_TAG));
        assert!(shown.iter().all(|r| !r.require_interaction && !r.silent));
    }

    #[tokio::test]
    async fn test_show_notification_failure_returns_none() {
        let db = Database::open(":memory:").await.unwrap();
        let mut notifier = FakeNotifier::granted();
        notifier.fail_show = true;
        let c = controller(notifier, db, unreachable_feed()).await;

        assert!(c.show_notification("a", "b", DEFAULT_ICON, None).is_none());
    }

    #[tokio::test]
    async fn test_show_notification_needs_grant() {
        let db = Database::open(":memory:").await.unwrap();
        let c = controller(FakeNotifier::new(Permission::Default), db, unreachable_feed()).await;

        assert!(c.show_notification("a", "b", DEFAULT_ICON, None).is_none());
        assert!(c.notifier().shown().is_empty());
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_check_disabled_is_noop() {
        let server = serve_feed(feed_body(&[]), 0).await;
        let db = db_with(false, None).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_check_without_permission_is_noop() {
        let server = serve_feed(feed_body(&[]), 0).await;
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::new(Permission::Denied), db, feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::NotPermitted);
    }

    #[tokio::test]
    async fn test_first_check_notifies_and_sets_checkpoint() {
        let body = feed_body(&[("Old bulletin", "https://example.com/old", NOW - 1000 * HOUR_MS)]);
        let server = serve_feed(body, 1).await;
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::granted(), db.clone(), feed_client(&server.uri())).await;

        assert_eq!(
            c.check_for_updates_at(NOW).await,
            CheckOutcome::NewEntry { shown: true }
        );
        assert_eq!(c.notifier().shown().len(), 1);
        assert_eq!(c.settings().await.last_check, Some(NOW));
        assert_eq!(
            db.get_preference(LAST_CHECK_KEY).await.unwrap(),
            Some(NOW.to_string())
        );
    }

    #[tokio::test]
    async fn test_item_not_newer_only_advances_checkpoint() {
        let last = NOW - 7 * HOUR_MS;
        let body = feed_body(&[("Seen", "https://example.com/seen", last)]);
        let server = serve_feed(body, 1).await;
        let db = db_with(true, Some(last)).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::UpToDate);
        assert!(c.notifier().shown().is_empty());
        assert_eq!(c.settings().await.last_check, Some(NOW));
    }

    #[tokio::test]
    async fn test_checks_within_interval_fetch_once() {
        let body = feed_body(&[("A", "https://example.com/a", NOW - HOUR_MS)]);
        let server = serve_feed(body, 1).await;
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert!(matches!(
            c.check_for_updates_at(NOW).await,
            CheckOutcome::NewEntry { .. }
        ));
        assert_eq!(
            c.check_for_updates_at(NOW + 5 * HOUR_MS).await,
            CheckOutcome::RateLimited
        );
        // Dropping the server verifies the single hit
    }

    #[tokio::test]
    async fn test_check_after_interval_fetches_again() {
        let body = feed_body(&[("A", "https://example.com/a", NOW - HOUR_MS)]);
        let server = serve_feed(body, 2).await;
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        c.check_for_updates_at(NOW).await;
        assert_eq!(
            c.check_for_updates_at(NOW + 6 * HOUR_MS).await,
            CheckOutcome::UpToDate
        );
    }

    #[tokio::test]
    async fn test_empty_feed_advances_checkpoint() {
        let server = serve_feed(feed_body(&[]), 1).await;
        let db = db_with(true, Some(NOW - 7 * HOUR_MS)).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::EmptyFeed);
        assert!(c.notifier().shown().is_empty());
        assert_eq!(c.settings().await.last_check, Some(NOW));
    }

    #[tokio::test]
    async fn test_http_error_leaves_checkpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let last = NOW - 7 * HOUR_MS;
        let db = db_with(true, Some(last)).await;
        let c = controller(FakeNotifier::granted(), db.clone(), feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::Failed);
        assert!(c.notifier().shown().is_empty());
        assert_eq!(c.settings().await.last_check, Some(last));
        assert_eq!(
            db.get_preference(LAST_CHECK_KEY).await.unwrap(),
            Some(last.to_string())
        );
    }

    #[tokio::test]
    async fn test_network_error_leaves_checkpoint() {
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::granted(), db, unreachable_feed()).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::Failed);
        assert_eq!(c.settings().await.last_check, None);
    }

    #[tokio::test]
    async fn test_malformed_feed_leaves_checkpoint() {
        let server = serve_feed(r#"{"entries": []}"#.to_string(), 1).await;
        let db = db_with(true, None).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::Failed);
        assert_eq!(c.settings().await.last_check, None);
    }

    #[tokio::test]
    async fn test_display_failure_still_advances_checkpoint() {
        let body = feed_body(&[("A", "https://example.com/a", NOW - HOUR_MS)]);
        let server = serve_feed(body, 1).await;
        let db = db_with(true, None).await;
        let mut notifier = FakeNotifier::granted();
        notifier.fail_show = true;
        let c = controller(notifier, db, feed_client(&server.uri())).await;

        assert_eq!(
            c.check_for_updates_at(NOW).await,
            CheckOutcome::NewEntry { shown: false }
        );
        assert_eq!(c.settings().await.last_check, Some(NOW));
    }

    #[tokio::test]
    async fn test_new_bulletin_scenario() {
        let body = feed_body(&[
            ("APSB24-01", "https://example.com/a", NOW - HOUR_MS),
            ("APSB23-99", "https://example.com/b", NOW - 48 * HOUR_MS),
        ]);
        let server = serve_feed(body, 1).await;
        let db = db_with(true, Some(NOW - 7 * HOUR_MS)).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(
            c.check_for_updates_at(NOW).await,
            CheckOutcome::NewEntry { shown: true }
        );
        let shown = c.notifier().shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, NEW_BULLETIN_TITLE);
        assert_eq!(shown[0].body, "APSB24-01");
        assert_eq!(shown[0].url.as_deref(), Some("https://example.com/a"));
        assert_eq!(c.settings().await.last_check, Some(NOW));
    }

    #[tokio::test]
    async fn test_older_item_without_url_does_not_block_notification() {
        let date = |millis: i64| {
            chrono::DateTime::from_timestamp_millis(millis)
                .unwrap()
                .to_rfc3339()
        };
        let body = serde_json::json!({
            "items": [
                {"title": "APSB24-01", "url": "https://example.com/a", "date_published": date(NOW - HOUR_MS)},
                {"id": "2", "title": "microblog note", "date_published": date(NOW - 48 * HOUR_MS)}
            ]
        })
        .to_string();
        let server = serve_feed(body, 1).await;
        let db = db_with(true, Some(NOW - 7 * HOUR_MS)).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(
            c.check_for_updates_at(NOW).await,
            CheckOutcome::NewEntry { shown: true }
        );
        assert_eq!(c.notifier().shown()[0].body, "APSB24-01");
        assert_eq!(c.settings().await.last_check, Some(NOW));
    }

    // ------------------------------------------------------------------------
    // Periodic checks and toggle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_when_disabled_is_noop() {
        let db = db_with(false, None).await;
        let c = Arc::new(controller(FakeNotifier::granted(), db, unreachable_feed()).await);

        assert!(!c.start_periodic_checks().await);
        assert!(!c.periodic_checks_active().await);
    }

    #[tokio::test]
    async fn test_start_runs_immediate_check_and_arms_once() {
        let server = serve_feed(feed_body(&[]), 1).await;
        let db = db_with(true, None).await;
        let c = Arc::new(controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await);

        assert!(c.start_periodic_checks().await);
        assert!(!c.start_periodic_checks().await, "second start must not arm another timer");
        assert!(c.periodic_checks_active().await);

        // Wait for the immediate check to record its checkpoint
        for _ in 0..100 {
            if c.settings().await.last_check.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(c.settings().await.last_check.is_some());

        assert!(c.stop_periodic_checks().await);
        assert!(!c.periodic_checks_active().await);
        assert!(!c.stop_periodic_checks().await);
    }

    #[tokio::test]
    async fn test_timer_checks_again_every_interval() {
        let server = serve_feed(feed_body(&[]), 3..).await;
        let db = db_with(true, None).await;
        let options = ControllerOptions {
            check_interval: Duration::from_millis(100),
            ..ControllerOptions::default()
        };
        let c = Arc::new(
            NotificationController::new(
                FakeNotifier::granted(),
                db,
                feed_client(&server.uri()),
                options,
            )
            .await,
        );

        assert!(c.start_periodic_checks().await);
        for _ in 0..100 {
            if server.received_requests().await.unwrap().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(c.stop_periodic_checks().await);
        assert!(server.received_requests().await.unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn test_tick_tolerates_small_clock_shortfall() {
        let server = serve_feed(feed_body(&[]), 1).await;
        // Checkpoint 30 seconds short of a full interval
        let last = NOW - 6 * HOUR_MS + 30_000;
        let db = db_with(true, Some(last)).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(c.check_for_updates_at(NOW).await, CheckOutcome::RateLimited);
        assert_eq!(
            c.check_with_tolerance(NOW, TICK_TOLERANCE).await,
            CheckOutcome::EmptyFeed
        );
        assert_eq!(c.settings().await.last_check, Some(NOW));
    }

    #[tokio::test]
    async fn test_tick_tolerance_is_bounded() {
        let server = serve_feed(feed_body(&[]), 0).await;
        let last = NOW - 6 * HOUR_MS + 5 * 60_000;
        let db = db_with(true, Some(last)).await;
        let c = controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await;

        assert_eq!(
            c.check_with_tolerance(NOW, TICK_TOLERANCE).await,
            CheckOutcome::RateLimited
        );
    }

    #[tokio::test]
    async fn test_disable_stops_timer() {
        // Each armed timer may or may not reach its immediate check before being stopped
        let server = serve_feed(feed_body(&[]), 0..=2).await;
        let db = db_with(true, None).await;
        let c = Arc::new(controller(FakeNotifier::granted(), db, feed_client(&server.uri())).await);

        assert!(c.start_periodic_checks().await);
        c.disable().await;
        assert!(!c.periodic_checks_active().await);

        // Re-enabling arms a fresh timer
        assert!(c.request_permission().await);
        assert!(c.start_periodic_checks().await);
        c.stop_periodic_checks().await;
    }

    #[tokio::test]
    async fn test_toggle_unsupported_changes_nothing() {
        let db = Database::open(":memory:").await.unwrap();
        let mut notifier = FakeNotifier::new(Permission::Default);
        notifier.supported = false;
        let c = Arc::new(controller(notifier, db.clone(), unreachable_feed()).await);

        assert_eq!(c.toggle().await, ToggleOutcome::Unsupported);
        assert!(!ToggleOutcome::Unsupported.is_enabled());
        assert_eq!(c.notifier().prompts(), 0);
        assert_eq!(db.get_preference(PREFERENCE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_toggle_enables_then_disables() {
        let server = serve_feed(feed_body(&[]), 0..=1).await;
        let db = Database::open(":memory:").await.unwrap();
        let c = Arc::new(
            controller(FakeNotifier::new(Permission::Default), db.clone(), feed_client(&server.uri()))
                .await,
        );

        let outcome = c.toggle().await;
        assert_eq!(outcome, ToggleOutcome::Enabled);
        assert!(outcome.is_enabled());
        assert_eq!(
            db.get_preference(PREFERENCE_KEY).await.unwrap().as_deref(),
            Some(r#"{"enabled":true}"#)
        );
        let shown = c.notifier().shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, WELCOME_TITLE);
        assert!(c.periodic_checks_active().await);

        assert_eq!(c.toggle().await, ToggleOutcome::Disabled);
        assert!(!c.periodic_checks_active().await);
        assert_eq!(
            db.get_preference(PREFERENCE_KEY).await.unwrap().as_deref(),
            Some(r#"{"enabled":false}"#)
        );
    }

    #[tokio::test]
    async fn test_toggle_refused_permission() {
        let db = Database::open(":memory:").await.unwrap();
        let notifier = FakeNotifier::new(Permission::Default).answering(Some(Permission::Denied));
        let c = Arc::new(controller(notifier, db, unreachable_feed()).await);

        assert_eq!(c.toggle().await, ToggleOutcome::NotGranted);
        assert!(!c.periodic_checks_active().await);
    }
}

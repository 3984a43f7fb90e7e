//! Lifecycle manager for the vendor SDK integration.
//!
//! Owns the pending queue, the user session, and the initialization state
//! machine (`Uninitialized → Initializing → {Ready, Failed}`). Constructed
//! explicitly and shared as `Arc<FormbricksManager>`; nothing here is a
//! process-global singleton. No call on this type ever returns an error to
//! the hosting request path: failures degrade to queueing or dropping, and
//! `initialize` is the only fallible entry point.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use backon::{ConstantBuilder, Retryable};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use super::{
    api_client::{EnvironmentCheck, FormbricksApiClient, FormbricksApiError},
    config::{ConfigError, FormbricksConfig},
    queue::PendingQueue,
    sdk::{VendorSdk, VendorSdkError},
    suppress::VendorLogSink,
};
use crate::models::TrackingEvent;

const SETUP_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
const SETUP_MAX_RETRIES: usize = 3;
const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);
const READY_POLL_ATTEMPTS: u32 = 40;
/// Soft deadline after which `status()` reports the attempt as timed out.
/// The attempt itself keeps running; reaching Ready clears the flag.
const INIT_SOFT_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("vendor sdk setup failed after retries: {0}")]
    Setup(String),
    #[error("vendor sdk never became ready after setup")]
    NeverReady,
    #[error("api client error: {0}")]
    Api(#[from] FormbricksApiError),
    #[error("integration disabled by an earlier initialization failure")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub state: LifecycleState,
    pub queued_events: usize,
    pub has_user: bool,
    pub timed_out: bool,
    pub hidden_fields_disabled: bool,
}

#[derive(Debug)]
struct ManagerInner {
    state: LifecycleState,
    queue: PendingQueue,
    user_id: Option<String>,
    last_attribute_hash: Option<String>,
    timed_out: bool,
}

pub struct FormbricksManager {
    config: FormbricksConfig,
    sdk: Arc<dyn VendorSdk>,
    api: FormbricksApiClient,
    sink: VendorLogSink,
    inner: Mutex<ManagerInner>,
    /// Serializes initialization so concurrent callers share one attempt.
    init_lock: Mutex<()>,
    /// Learned from a single survey's configuration and held for the process
    /// lifetime; over-broad for surveys that do support hidden fields.
    hidden_fields_disabled: AtomicBool,
}

impl FormbricksManager {
    pub fn new(config: FormbricksConfig, sdk: Arc<dyn VendorSdk>) -> Result<Self, ManagerError> {
        let api = FormbricksApiClient::new(&config)?;
        Ok(Self {
            config,
            sdk,
            api,
            sink: VendorLogSink::default(),
            inner: Mutex::new(ManagerInner {
                state: LifecycleState::Uninitialized,
                queue: PendingQueue::default(),
                user_id: None,
                last_attribute_hash: None,
                timed_out: false,
            }),
            init_lock: Mutex::new(()),
            hidden_fields_disabled: AtomicBool::new(false),
        })
    }

    /// Initialize the vendor SDK. Idempotent: a second caller while an
    /// attempt is in flight waits on the same attempt; a call after success
    /// is a no-op; a call after terminal failure reports Disabled without
    /// retrying.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        let _guard = self.init_lock.lock().await;
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                LifecycleState::Ready => return Ok(()),
                LifecycleState::Failed => return Err(ManagerError::Disabled),
                _ => inner.state = LifecycleState::Initializing,
            }
        }

        let started = tokio::time::Instant::now();
        match self.run_initialization(started).await {
            Ok(()) => {
                self.become_ready().await;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.state = LifecycleState::Failed;
                error!(
                    error = %e,
                    "formbricks initialization failed; feedback features are disabled, the \
                     rest of the application is unaffected"
                );
                Err(e)
            }
        }
    }

    async fn run_initialization(&self, started: tokio::time::Instant) -> Result<(), ManagerError> {
        self.config.validate()?;

        // Best effort: an unreachable or even missing environment upstream
        // must not block initialization.
        match self.api.validate_environment().await {
            Ok(EnvironmentCheck::Valid) => {
                debug!(environment_id = %self.config.environment_id, "environment id validated")
            }
            Ok(EnvironmentCheck::NotFound) => warn!(
                environment_id = %self.config.environment_id,
                "environment id not found upstream, proceeding anyway"
            ),
            Err(e) => warn!(
                error = %e,
                "environment validation unreachable, proceeding optimistically"
            ),
        }
        self.note_soft_deadline(started).await;

        let sdk = Arc::clone(&self.sdk);
        let config = self.config.clone();
        (|| {
            let sdk = Arc::clone(&sdk);
            let config = config.clone();
            async move { sdk.setup(&config).await }
        })
        .retry(
            &ConstantBuilder::default()
                .with_delay(SETUP_RETRY_DELAY)
                .with_max_times(SETUP_MAX_RETRIES),
        )
        .when(|e: &VendorSdkError| {
            matches!(e, VendorSdkError::Setup(_) | VendorSdkError::Transport(_))
        })
        .notify(|e, dur| {
            warn!(
                "sdk setup failed, retrying after {:.2}s: {}",
                dur.as_secs_f64(),
                e
            )
        })
        .await
        .map_err(|e| ManagerError::Setup(e.to_string()))?;
        self.note_soft_deadline(started).await;

        // Readiness can lag the setup call; poll until track is callable.
        let mut attempts = 0;
        while !self.sdk.is_ready() {
            attempts += 1;
            if attempts > READY_POLL_ATTEMPTS {
                return Err(ManagerError::NeverReady);
            }
            self.note_soft_deadline(started).await;
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn note_soft_deadline(&self, started: tokio::time::Instant) {
        if started.elapsed() > INIT_SOFT_DEADLINE {
            let mut inner = self.inner.lock().await;
            if !inner.timed_out && inner.state == LifecycleState::Initializing {
                inner.timed_out = true;
                warn!("initialization exceeded the 10s soft deadline, continuing in background");
            }
        }
    }

    /// Transition to Ready and drain the pending queue transactionally.
    /// The inner lock is held for the whole drain, so calls racing in during
    /// the flush observe Ready only after every queued entry went out, which
    /// keeps the vendor seeing submission order.
    async fn become_ready(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = LifecycleState::Ready;
        // Late success un-flags the soft-deadline timeout.
        inner.timed_out = false;
        let drained = inner.queue.drain();
        info!(
            queued_events = drained.events.len(),
            "formbricks sdk ready, draining pending calls"
        );
        if let Some(user_id) = drained.user_id {
            self.apply_user_id(&mut inner, &user_id).await;
        }
        for event in drained.events {
            self.forward_event(event).await;
        }
        if !drained.attributes.is_empty() {
            self.apply_attributes(&mut inner, drained.attributes).await;
        }
    }

    /// Track an application event. Queued when not ready, forwarded when
    /// ready, dropped when the integration is disabled; never errors.
    pub async fn track(
        &self,
        event_name: &str,
        properties: Option<serde_json::Map<String, Value>>,
    ) {
        let event = TrackingEvent::new(event_name, properties);
        let mut inner = self.inner.lock().await;
        match inner.state {
            LifecycleState::Ready => self.forward_event(event).await,
            LifecycleState::Failed => {
                debug!(event_name, "integration disabled, dropping event")
            }
            _ => {
                inner.queue.push_event(event);
                debug!(
                    event_name,
                    queued = inner.queue.event_count(),
                    "sdk not ready, event queued"
                );
            }
        }
    }

    async fn forward_event(&self, mut event: TrackingEvent) {
        if self.hidden_fields_disabled.load(Ordering::SeqCst) {
            event.strip_hidden_fields();
        }
        match self.sdk.track(&event).await {
            Ok(()) => debug!(event_name = %event.event_name, "event forwarded"),
            Err(VendorSdkError::HiddenFieldsDisabled) => {
                self.hidden_fields_disabled.store(true, Ordering::SeqCst);
                debug!(
                    event_name = %event.event_name,
                    "hidden fields rejected, stripping and retrying once"
                );
                let mut stripped = event;
                stripped.strip_hidden_fields();
                // Single retry; a second rejection drops the event rather
                // than re-queueing forever.
                if let Err(e) = self.sdk.track(&stripped).await {
                    self.sink.vendor_error("track", &e);
                }
            }
            Err(e) => self.sink.vendor_error("track", &e),
        }
    }

    /// Apply user attributes. Content-identical maps are deduplicated
    /// against the last applied set; buffered and merged when not ready.
    pub async fn set_attributes(&self, attributes: serde_json::Map<String, Value>) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            LifecycleState::Ready => self.apply_attributes(&mut inner, attributes).await,
            LifecycleState::Failed => {
                debug!("integration disabled, dropping attributes")
            }
            _ => inner.queue.merge_attributes(attributes),
        }
    }

    async fn apply_attributes(
        &self,
        inner: &mut ManagerInner,
        attributes: serde_json::Map<String, Value>,
    ) {
        let hash = attribute_hash(&attributes);
        if inner.last_attribute_hash.as_deref() == Some(hash.as_str()) {
            debug!("attributes unchanged, skipping vendor call");
            return;
        }
        match self.sdk.set_attributes(&attributes).await {
            Ok(()) => inner.last_attribute_hash = Some(hash),
            Err(VendorSdkError::NoActiveUser) => {
                // Park them until identification; attributes attach to a
                // person record, which does not exist yet.
                debug!("no active user yet, buffering attributes");
                inner.queue.merge_attributes(attributes);
            }
            Err(e) => self.sink.vendor_error("setAttributes", &e),
        }
    }

    /// Associate a user id with the session. Idempotent for the active id;
    /// switching ids performs an implicit session reset first, since the
    /// vendor rejects a second `setUserId` on a live session.
    pub async fn set_user_id(&self, user_id: &str) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            LifecycleState::Ready => self.apply_user_id(&mut inner, user_id).await,
            LifecycleState::Failed => {
                debug!(user_id, "integration disabled, dropping user id")
            }
            _ => inner.queue.set_user_id(user_id),
        }
    }

    async fn apply_user_id(&self, inner: &mut ManagerInner, user_id: &str) {
        if inner.user_id.as_deref() == Some(user_id) {
            debug!(user_id, "user id already active");
            return;
        }
        if inner.user_id.is_some() {
            if let Err(e) = self.sdk.reset_session().await {
                self.sink.vendor_error("resetSession", &e);
            }
            inner.user_id = None;
            // Attribute state belonged to the old session.
            inner.last_attribute_hash = None;
        }
        let identified = match self.sdk.set_user_id(user_id).await {
            Ok(()) => true,
            Err(VendorSdkError::UserAlreadySet) => {
                // The vendor held a session we did not know about.
                self.sink
                    .vendor_error("setUserId", &VendorSdkError::UserAlreadySet);
                self.sdk.reset_session().await.is_ok()
                    && self.sdk.set_user_id(user_id).await.is_ok()
            }
            Err(e) => {
                self.sink.vendor_error("setUserId", &e);
                false
            }
        };
        if identified {
            inner.user_id = Some(user_id.to_string());
            // The hash tracked anonymous-session state, if any.
            inner.last_attribute_hash = None;
            let parked = inner.queue.take_attributes();
            if !parked.is_empty() {
                self.apply_attributes(inner, parked).await;
            }
        }
    }

    /// Clear the local session and best-effort reset the vendor session.
    pub async fn reset_user(&self) {
        let mut inner = self.inner.lock().await;
        inner.queue.clear_user_state();
        inner.user_id = None;
        inner.last_attribute_hash = None;
        if inner.state == LifecycleState::Ready {
            if let Err(e) = self.sdk.reset_session().await {
                self.sink.vendor_error("resetSession", &e);
            }
        }
    }

    /// Alias kept for call sites using the vendor's older naming.
    pub async fn logout_user(&self) {
        self.reset_user().await;
    }

    /// Forwarded when ready, dropped otherwise.
    pub async fn register_route_change(&self) {
        let inner = self.inner.lock().await;
        if inner.state == LifecycleState::Ready {
            if let Err(e) = self.sdk.register_route_change().await {
                self.sink.vendor_error("registerRouteChange", &e);
            }
        } else {
            debug!("route change before sdk ready, dropped");
        }
    }

    pub async fn status(&self) -> ManagerStatus {
        let inner = self.inner.lock().await;
        ManagerStatus {
            state: inner.state,
            queued_events: inner.queue.event_count(),
            has_user: inner.user_id.is_some(),
            timed_out: inner.timed_out,
            hidden_fields_disabled: self.hidden_fields_disabled.load(Ordering::SeqCst),
        }
    }

    /// Forget the learned hidden-fields capability flag.
    pub fn clear_capability_flags(&self) {
        self.hidden_fields_disabled.store(false, Ordering::SeqCst);
    }
}

fn attribute_hash(attributes: &serde_json::Map<String, Value>) -> String {
    // serde_json maps are ordered by key, so serialization is canonical.
    let bytes = serde_json::to_vec(attributes).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

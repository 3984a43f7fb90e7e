//! Capability seam over the vendor SDK. The lifecycle manager only ever
//! talks to `VendorSdk`; the session-reset call, whose name varies across
//! vendor SDK generations, is isolated behind one adapter per generation
//! selected at construction.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::config::FormbricksConfig;
use crate::models::TrackingEvent;

#[derive(Debug, Clone, Error)]
pub enum VendorSdkError {
    #[error("sdk setup failed: {0}")]
    Setup(String),
    #[error("sdk not ready")]
    NotReady,
    #[error("user id already set")]
    UserAlreadySet,
    #[error("no active user session")]
    NoActiveUser,
    #[error("hidden fields are disabled for this survey")]
    HiddenFieldsDisabled,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Vendor SDK generation. Determines which session-reset call exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdkGeneration {
    /// 1.x SDKs expose an explicit `logout` endpoint.
    Legacy,
    /// 2.x SDKs dropped it; resetting is a local person-state clear.
    #[default]
    Current,
}

impl SdkGeneration {
    pub fn from_version(version: &str) -> Self {
        match version.trim().split('.').next().and_then(|m| m.parse::<u32>().ok()) {
            Some(major) if major < 2 => Self::Legacy,
            _ => Self::Current,
        }
    }
}

/// The vendor SDK surface the lifecycle manager consumes.
#[async_trait]
pub trait VendorSdk: Send + Sync {
    async fn setup(&self, config: &FormbricksConfig) -> Result<(), VendorSdkError>;
    /// Readiness can lag a successful setup; the manager polls this.
    fn is_ready(&self) -> bool;
    async fn track(&self, event: &TrackingEvent) -> Result<(), VendorSdkError>;
    async fn set_attributes(
        &self,
        attributes: &serde_json::Map<String, Value>,
    ) -> Result<(), VendorSdkError>;
    async fn set_user_id(&self, user_id: &str) -> Result<(), VendorSdkError>;
    async fn reset_session(&self) -> Result<(), VendorSdkError>;
    async fn register_route_change(&self) -> Result<(), VendorSdkError>;
}

/// How a given SDK generation clears the active person session.
#[async_trait]
trait ResetAdapter: Send + Sync {
    async fn reset(&self, sdk: &HttpVendorSdk, user_id: Option<&str>) -> Result<(), VendorSdkError>;
}

/// Legacy SDKs: an explicit logout call against the client API.
struct LogoutEndpointAdapter;

#[async_trait]
impl ResetAdapter for LogoutEndpointAdapter {
    async fn reset(&self, sdk: &HttpVendorSdk, user_id: Option<&str>) -> Result<(), VendorSdkError> {
        if let Some(id) = user_id {
            let url = sdk.client_url(&format!("people/{id}/logout"))?;
            sdk.post_json(url, &serde_json::json!({})).await?;
        }
        Ok(())
    }
}

/// Current SDKs: no remote call, person state is dropped locally.
struct LocalResetAdapter;

#[async_trait]
impl ResetAdapter for LocalResetAdapter {
    async fn reset(&self, _sdk: &HttpVendorSdk, _user_id: Option<&str>) -> Result<(), VendorSdkError> {
        Ok(())
    }
}

fn reset_adapter_for(generation: SdkGeneration) -> Box<dyn ResetAdapter> {
    match generation {
        SdkGeneration::Legacy => Box::new(LogoutEndpointAdapter),
        SdkGeneration::Current => Box::new(LocalResetAdapter),
    }
}

/// Default implementation speaking to the Formbricks client API over HTTP.
pub struct HttpVendorSdk {
    http: Client,
    api_host: Url,
    environment_id: String,
    ready: AtomicBool,
    user_id: Mutex<Option<String>>,
    reset: Box<dyn ResetAdapter>,
}

impl HttpVendorSdk {
    pub fn new(config: &FormbricksConfig) -> Result<Arc<Self>, VendorSdkError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent(concat!("lawnquote-feedback/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VendorSdkError::Transport(e.to_string()))?;
        Ok(Arc::new(Self {
            http,
            api_host: config.api_host.clone(),
            environment_id: config.environment_id.clone(),
            ready: AtomicBool::new(false),
            user_id: Mutex::new(None),
            reset: reset_adapter_for(config.sdk_generation),
        }))
    }

    fn client_url(&self, path: &str) -> Result<Url, VendorSdkError> {
        self.api_host
            .join(&format!("api/v1/client/{}/{}", self.environment_id, path))
            .map_err(|e| VendorSdkError::Transport(e.to_string()))
    }

    async fn post_json(&self, url: Url, body: &Value) -> Result<(), VendorSdkError> {
        let res = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| VendorSdkError::Transport(e.to_string()))?;

        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => {
                let text = res.text().await.unwrap_or_default();
                Err(classify_rejection(&text))
            }
            s => Err(VendorSdkError::Transport(format!("http {}", s.as_u16()))),
        }
    }
}

/// Map a vendor rejection body onto the typed variants the manager recovers
/// from automatically.
fn classify_rejection(body: &str) -> VendorSdkError {
    let lower = body.to_lowercase();
    if lower.contains("already set") {
        VendorSdkError::UserAlreadySet
    } else if lower.contains("hidden field") {
        VendorSdkError::HiddenFieldsDisabled
    } else {
        VendorSdkError::Transport(format!("vendor rejected request: {body}"))
    }
}

#[async_trait]
impl VendorSdk for HttpVendorSdk {
    async fn setup(&self, _config: &FormbricksConfig) -> Result<(), VendorSdkError> {
        // Fetching the environment state is what the widget does on init;
        // a 200 here means the environment is live and we can forward.
        let url = self.client_url("environment")?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| VendorSdkError::Setup(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VendorSdkError::Setup(format!(
                "environment state fetch returned http {}",
                res.status().as_u16()
            )));
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn track(&self, event: &TrackingEvent) -> Result<(), VendorSdkError> {
        if !self.is_ready() {
            return Err(VendorSdkError::NotReady);
        }
        let url = self.client_url("actions")?;
        let user_id = self.user_id.lock().unwrap().clone();
        let body = serde_json::json!({
            "name": event.event_name,
            "properties": event.properties,
            "userId": user_id,
        });
        self.post_json(url, &body).await
    }

    async fn set_attributes(
        &self,
        attributes: &serde_json::Map<String, Value>,
    ) -> Result<(), VendorSdkError> {
        if !self.is_ready() {
            return Err(VendorSdkError::NotReady);
        }
        let user_id = self.user_id.lock().unwrap().clone();
        let Some(id) = user_id else {
            return Err(VendorSdkError::NoActiveUser);
        };
        let url = self.client_url(&format!("people/{id}/attributes"))?;
        self.post_json(url, &serde_json::json!({ "attributes": attributes }))
            .await
    }

    async fn set_user_id(&self, user_id: &str) -> Result<(), VendorSdkError> {
        if !self.is_ready() {
            return Err(VendorSdkError::NotReady);
        }
        {
            let current = self.user_id.lock().unwrap();
            if let Some(existing) = current.as_deref() {
                if existing != user_id {
                    return Err(VendorSdkError::UserAlreadySet);
                }
                return Ok(());
            }
        }
        let url = self.client_url("people")?;
        self.post_json(url, &serde_json::json!({ "userId": user_id }))
            .await?;
        *self.user_id.lock().unwrap() = Some(user_id.to_string());
        Ok(())
    }

    async fn reset_session(&self) -> Result<(), VendorSdkError> {
        let user_id = self.user_id.lock().unwrap().clone();
        self.reset.reset(self, user_id.as_deref()).await?;
        *self.user_id.lock().unwrap() = None;
        Ok(())
    }

    async fn register_route_change(&self) -> Result<(), VendorSdkError> {
        if !self.is_ready() {
            return Err(VendorSdkError::NotReady);
        }
        // No server-side effect; the widget uses this to re-evaluate no-code
        // actions on navigation.
        debug!("route change registered");
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! Recording SDK used by manager tests.

    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    };

    use super::*;
    use crate::models::HIDDEN_FIELDS_KEY;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SdkCall {
        Setup,
        Track(TrackingEvent),
        SetAttributes(serde_json::Map<String, Value>),
        SetUserId(String),
        Reset,
        RouteChange,
    }

    #[derive(Default)]
    pub struct RecordingSdk {
        pub calls: Mutex<Vec<SdkCall>>,
        /// Number of `is_ready` polls that report false after setup.
        pub ready_after_polls: AtomicU32,
        /// Number of setup calls that fail before one succeeds.
        pub setup_failures: AtomicU32,
        /// Reject events carrying `hiddenFields` with the capability error.
        pub reject_hidden_fields: AtomicBool,
        /// Reject attribute pushes while no user id is set.
        pub reject_attributes_without_user: AtomicBool,
        setup_done: AtomicBool,
        user_id: Mutex<Option<String>>,
    }

    impl RecordingSdk {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn tracked_names(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    SdkCall::Track(e) => Some(e.event_name.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, matcher: impl Fn(&SdkCall) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| matcher(c)).count()
        }
    }

    #[async_trait]
    impl VendorSdk for RecordingSdk {
        async fn setup(&self, _config: &FormbricksConfig) -> Result<(), VendorSdkError> {
            self.calls.lock().unwrap().push(SdkCall::Setup);
            let remaining = self.setup_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.setup_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(VendorSdkError::Setup("simulated setup failure".into()));
            }
            self.setup_done.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_ready(&self) -> bool {
            if !self.setup_done.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = self.ready_after_polls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.ready_after_polls.store(remaining - 1, Ordering::SeqCst);
                return false;
            }
            true
        }

        async fn track(&self, event: &TrackingEvent) -> Result<(), VendorSdkError> {
            let has_hidden = event
                .properties
                .as_ref()
                .is_some_and(|p| p.contains_key(HIDDEN_FIELDS_KEY));
            if has_hidden && self.reject_hidden_fields.load(Ordering::SeqCst) {
                return Err(VendorSdkError::HiddenFieldsDisabled);
            }
            self.calls.lock().unwrap().push(SdkCall::Track(event.clone()));
            Ok(())
        }

        async fn set_attributes(
            &self,
            attributes: &serde_json::Map<String, Value>,
        ) -> Result<(), VendorSdkError> {
            if self.reject_attributes_without_user.load(Ordering::SeqCst)
                && self.user_id.lock().unwrap().is_none()
            {
                return Err(VendorSdkError::NoActiveUser);
            }
            self.calls
                .lock()
                .unwrap()
                .push(SdkCall::SetAttributes(attributes.clone()));
            Ok(())
        }

        async fn set_user_id(&self, user_id: &str) -> Result<(), VendorSdkError> {
            let mut current = self.user_id.lock().unwrap();
            if let Some(existing) = current.as_deref() {
                if existing != user_id {
                    return Err(VendorSdkError::UserAlreadySet);
                }
            }
            *current = Some(user_id.to_string());
            self.calls
                .lock()
                .unwrap()
                .push(SdkCall::SetUserId(user_id.to_string()));
            Ok(())
        }

        async fn reset_session(&self) -> Result<(), VendorSdkError> {
            *self.user_id.lock().unwrap() = None;
            self.calls.lock().unwrap().push(SdkCall::Reset);
            Ok(())
        }

        async fn register_route_change(&self) -> Result<(), VendorSdkError> {
            self.calls.lock().unwrap().push(SdkCall::RouteChange);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_from_version_string() {
        assert_eq!(SdkGeneration::from_version("1.6.5"), SdkGeneration::Legacy);
        assert_eq!(SdkGeneration::from_version("2.0.0"), SdkGeneration::Current);
        assert_eq!(SdkGeneration::from_version("garbage"), SdkGeneration::Current);
    }

    #[test]
    fn rejection_bodies_map_to_typed_errors() {
        assert!(matches!(
            classify_rejection(r#"{"message":"userId is already set"}"#),
            VendorSdkError::UserAlreadySet
        ));
        assert!(matches!(
            classify_rejection(r#"{"message":"hidden field support is disabled"}"#),
            VendorSdkError::HiddenFieldsDisabled
        ));
        assert!(matches!(
            classify_rejection("something else"),
            VendorSdkError::Transport(_)
        ));
    }
}

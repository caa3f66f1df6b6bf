//! Alert dispatch.
//!
//! The coordinator decides *whether* to alert; the two collaborator traits
//! below decide *where* the alert goes. Both collaborators are best-effort:
//! their failures end up on the [`AlertEvent`], never in the caller.

pub mod coordinator;
pub mod event;
#[cfg(feature = "cloud")]
pub mod http;
pub mod message;

pub use coordinator::{
    device_id, AlertCoordinator, AlertDetails, AlertSettings, Clock, ManualClock, SystemClock,
};
pub use event::{AlertEvent, AlertOutcome, AlertRecord, DeliveryStatus};
pub use message::{format_alert_message, parse_timezone};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Collaborator call failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("alert backend config error: {0}")]
    Config(String),
    #[error("alert backend network error: {0}")]
    Network(String),
    #[error("alert backend returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("alert backend response could not be parsed: {0}")]
    Serialization(String),
}

/// Remote alert store.
#[async_trait]
pub trait AlertStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a record, returning the store's identifier for it.
    async fn record(&self, record: &AlertRecord) -> Result<String, DispatchError>;
}

/// Human notification relay.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, recipient: &str, message: &str) -> Result<(), DispatchError>;
}

/// Store that only logs. Used when no backend is configured.
#[derive(Debug, Default, Clone)]
pub struct LogStore;

#[async_trait]
impl AlertStore for LogStore {
    fn name(&self) -> &str {
        "log"
    }

    async fn record(&self, record: &AlertRecord) -> Result<String, DispatchError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(
            id = %id,
            probability = record.probability,
            mode = %record.mode,
            label = %record.label,
            "alert recorded locally"
        );
        Ok(id)
    }
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, recipient: &str, message: &str) -> Result<(), DispatchError> {
        tracing::info!(recipient, message, "alert notification");
        Ok(())
    }
}

/// Which alert store to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Log,
    /// Firestore REST collection, e.g. `Historial/Personas/Vicente`
    Firestore {
        project_id: String,
        collection: String,
        #[serde(default)]
        api_key: Option<String>,
    },
    /// Plain JSON POST endpoint (e.g. a realtime database `alerts.json`)
    Json { url: String },
}

/// Which notifier to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierBackend {
    #[default]
    Log,
    /// CallMeBot WhatsApp relay
    CallMeBot { api_key: String },
}

/// Instantiate the configured store.
pub fn build_store(backend: &StoreBackend) -> Result<Arc<dyn AlertStore>, DispatchError> {
    match backend {
        StoreBackend::Log => Ok(Arc::new(LogStore)),
        #[cfg(feature = "cloud")]
        StoreBackend::Firestore {
            project_id,
            collection,
            api_key,
        } => Ok(Arc::new(http::FirestoreStore::new(
            project_id,
            collection,
            api_key.clone(),
        )?)),
        #[cfg(feature = "cloud")]
        StoreBackend::Json { url } => Ok(Arc::new(http::JsonStore::new(url)?)),
        #[cfg(not(feature = "cloud"))]
        _ => Err(DispatchError::Config(
            "HTTP alert stores require the `cloud` feature".to_string(),
        )),
    }
}

/// Instantiate the configured notifier.
pub fn build_notifier(backend: &NotifierBackend) -> Result<Arc<dyn Notifier>, DispatchError> {
    match backend {
        NotifierBackend::Log => Ok(Arc::new(LogNotifier)),
        #[cfg(feature = "cloud")]
        NotifierBackend::CallMeBot { api_key } => {
            Ok(Arc::new(http::CallMeBotNotifier::new(api_key)?))
        }
        #[cfg(not(feature = "cloud"))]
        _ => Err(DispatchError::Config(
            "HTTP notifiers require the `cloud` feature".to_string(),
        )),
    }
}

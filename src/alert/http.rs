//! HTTP alert backends: Firestore, plain JSON endpoints and the CallMeBot
//! WhatsApp relay.

use crate::alert::event::AlertRecord;
use crate::alert::{AlertStore, DispatchError, Notifier};
use crate::core::types::{Channel, SixAxisReading};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{json, Map, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default CallMeBot endpoint.
pub const CALLMEBOT_URL: &str = "https://api.callmebot.com/whatsapp.php";

fn build_client() -> Result<reqwest::Client, DispatchError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("fallwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| DispatchError::Config(format!("failed to create HTTP client: {e}")))
}

/// Turn a non-2xx response into a [`DispatchError::Server`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(DispatchError::Server {
        status: status.as_u16(),
        message: message.chars().take(200).collect(),
    })
}

/// Firestore REST store. Each alert becomes a new document in a collection.
pub struct FirestoreStore {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl FirestoreStore {
    pub fn new(
        project_id: &str,
        collection: &str,
        api_key: Option<String>,
    ) -> Result<Self, DispatchError> {
        if project_id.is_empty() || collection.is_empty() {
            return Err(DispatchError::Config(
                "firestore store needs a project id and a collection path".to_string(),
            ));
        }
        Ok(Self {
            client: build_client()?,
            url: Self::collection_url(project_id, collection),
            api_key,
        })
    }

    pub fn collection_url(project_id: &str, collection: &str) -> String {
        format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/(default)/documents/{}",
            project_id,
            collection.trim_matches('/')
        )
    }

    /// Typed Firestore document for a record.
    pub fn document(record: &AlertRecord) -> Value {
        let mut fields = Map::new();
        fields.insert(
            "timestamp".to_string(),
            json!({ "timestampValue": record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true) }),
        );
        fields.insert(
            "probability".to_string(),
            json!({ "doubleValue": record.probability as f64 }),
        );
        fields.insert("label".to_string(), json!({ "stringValue": record.label }));
        fields.insert(
            "sensors".to_string(),
            json!({ "stringValue": record.mode.to_string() }),
        );
        fields.insert("person".to_string(), json!({ "stringValue": record.person }));
        fields.insert("device".to_string(), json!({ "stringValue": record.device }));

        for channel in Channel::ALL {
            if let Some(reading) = record.snapshots.get(channel) {
                insert_axes(&mut fields, &channel, &reading);
            }
        }

        json!({ "fields": fields })
    }
}

fn insert_axes(fields: &mut Map<String, Value>, channel: &Channel, reading: &SixAxisReading) {
    let names = ["ax", "ay", "az", "gx", "gy", "gz"];
    for (name, value) in names.iter().zip(reading.to_array()) {
        fields.insert(
            format!("{}_{}", channel.name(), name),
            json!({ "doubleValue": value as f64 }),
        );
    }
}

#[async_trait]
impl AlertStore for FirestoreStore {
    fn name(&self) -> &str {
        "firestore"
    }

    async fn record(&self, record: &AlertRecord) -> Result<String, DispatchError> {
        let mut request = self.client.post(&self.url).json(&Self::document(record));
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;

        // "projects/<p>/databases/(default)/documents/<path>/<id>"
        body.get("name")
            .and_then(Value::as_str)
            .and_then(|name| name.rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| DispatchError::Serialization("response has no document name".to_string()))
    }
}

/// Store that POSTs the record as plain JSON.
pub struct JsonStore {
    client: reqwest::Client,
    url: String,
}

impl JsonStore {
    pub fn new(url: &str) -> Result<Self, DispatchError> {
        if url.is_empty() {
            return Err(DispatchError::Config("json store needs a url".to_string()));
        }
        Ok(Self {
            client: build_client()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AlertStore for JsonStore {
    fn name(&self) -> &str {
        "json"
    }

    async fn record(&self, record: &AlertRecord) -> Result<String, DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;

        body.get("name")
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DispatchError::Serialization("response has no record id".to_string()))
    }
}

/// WhatsApp messages through the CallMeBot relay.
pub struct CallMeBotNotifier {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl CallMeBotNotifier {
    pub fn new(api_key: &str) -> Result<Self, DispatchError> {
        Self::with_base_url(api_key, CALLMEBOT_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, DispatchError> {
        if api_key.is_empty() {
            return Err(DispatchError::Config("CallMeBot needs an api key".to_string()));
        }
        Ok(Self {
            client: build_client()?,
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
        })
    }

    /// The full GET request, with every parameter URL-encoded.
    pub fn request(&self, recipient: &str, message: &str) -> Result<reqwest::Request, DispatchError> {
        self.client
            .get(&self.base_url)
            .query(&[
                ("phone", recipient.trim_start_matches('+')),
                ("text", message),
                ("apikey", self.api_key.as_str()),
            ])
            .build()
            .map_err(|e| DispatchError::Config(e.to_string()))
    }
}

#[async_trait]
impl Notifier for CallMeBotNotifier {
    fn name(&self) -> &str {
        "callmebot"
    }

    async fn notify(&self, recipient: &str, message: &str) -> Result<(), DispatchError> {
        if recipient.is_empty() {
            return Err(DispatchError::Config("no recipient configured".to_string()));
        }
        let request = self.request(recipient, message)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| DispatchError::Network(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }
}

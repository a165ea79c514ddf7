//! Remote document store contract and its HTTP implementation.
//!
//! The sync engine only needs CRUD on named collections. [`RemoteStore`] is
//! that contract; [`HttpRemote`] speaks it to a JSON document-store API:
//!
//! - `POST   {base}/{collection}`        body: fields, returns `{"key": ..}`
//! - `PUT    {base}/{collection}/{key}`  body: fields
//! - `DELETE {base}/{collection}/{key}`
//! - `GET    {base}/{collection}`        returns `[{"key": .., "fields": {..}}]`

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::config::RemoteConfig;
use crate::error::{RemoteError, TillError, TillResult};
use crate::models::{Fields, Record};

/// Maximum length of a response body quoted in an error message
const MAX_ERROR_BODY: usize = 512;

/// Trait for remote document store implementations.
///
/// Keys are assigned by the remote on create. `update` fails if the key does
/// not exist remotely.
pub trait RemoteStore: Send + Sync {
    /// Create a record and return the key the remote assigned
    fn create(
        &self,
        collection: &str,
        fields: &Fields,
    ) -> impl std::future::Future<Output = Result<String, RemoteError>> + Send;

    /// Replace the fields of an existing record
    fn update(
        &self,
        collection: &str,
        key: &str,
        fields: &Fields,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Delete a record
    fn delete(
        &self,
        collection: &str,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Fetch every record of a collection
    fn list(
        &self,
        collection: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Record>, RemoteError>> + Send;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    key: String,
}

/// [`RemoteStore`] over HTTP
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    /// Create a client from configuration. Fails if no base URL is set.
    pub fn new(config: &RemoteConfig) -> TillResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| TillError::Config("remote.base_url is not set".to_string()))?;
        Self::with_base_url(base_url, Duration::from_secs(config.timeout_secs))
    }

    /// Create a client for an explicit base URL
    pub fn with_base_url(base_url: &str, timeout: Duration) -> TillResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TillError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(collection))
    }

    fn record_url(&self, collection: &str, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            urlencoding::encode(collection),
            urlencoding::encode(key)
        )
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Unreachable(err.to_string())
}

/// Map a non-2xx response to an error, passing successful responses through
async fn check_status(response: Response, target: &str) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(target.to_string()));
    }

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    Err(RemoteError::Rejected {
        status: status.as_u16(),
        message,
    })
}

impl RemoteStore for HttpRemote {
    async fn create(&self, collection: &str, fields: &Fields) -> Result<String, RemoteError> {
        let response = self
            .client
            .post(self.collection_url(collection))
            .json(fields)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, collection).await?;

        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("create: {}", e)))?;
        if created.key.trim().is_empty() {
            return Err(RemoteError::InvalidResponse(
                "create returned an empty key".to_string(),
            ));
        }
        Ok(created.key)
    }

    async fn update(&self, collection: &str, key: &str, fields: &Fields) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(self.record_url(collection, key))
            .json(fields)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, &format!("{}:{}", collection, key)).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.record_url(collection, key))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, &format!("{}:{}", collection, key)).await?;
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Record>, RemoteError> {
        let response = self
            .client
            .get(self.collection_url(collection))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, collection).await?;

        response
            .json::<Vec<Record>>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("list: {}", e)))
    }
}

/// In-memory remote with failure injection, for engine and repository tests
#[cfg(test)]
pub(crate) mod memory {
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use serde_json::Value;
    use tokio::sync::watch;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Create(String),
        Update(String, String),
        Delete(String, String),
        List(String),
    }

    pub struct MemoryRemote {
        records: Mutex<Vec<(String, Record)>>,
        next_id: AtomicU64,
        assigned_keys: Mutex<VecDeque<String>>,
        failing_keys: Mutex<HashSet<String>>,
        failing_fields: Mutex<Vec<(String, Value)>>,
        unreachable: AtomicBool,
        paused: watch::Sender<bool>,
        replies_held: watch::Sender<bool>,
        calls: Mutex<Vec<Call>>,
    }

    impl MemoryRemote {
        pub fn new() -> Self {
            let (paused, _) = watch::channel(false);
            let (replies_held, _) = watch::channel(false);
            Self {
                records: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                assigned_keys: Mutex::new(VecDeque::new()),
                failing_keys: Mutex::new(HashSet::new()),
                failing_fields: Mutex::new(Vec::new()),
                unreachable: AtomicBool::new(false),
                paused,
                replies_held,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Key to hand out on the next create instead of `srv-N`
        pub fn assign_next_key(&self, key: &str) {
            self.assigned_keys.lock().unwrap().push_back(key.to_string());
        }

        /// Make updates and deletes of `key` fail
        pub fn fail_key(&self, key: &str) {
            self.failing_keys.lock().unwrap().insert(key.to_string());
        }

        pub fn heal_key(&self, key: &str) {
            self.failing_keys.lock().unwrap().remove(key);
        }

        /// Make creates and updates whose payload has `name == value` fail
        pub fn fail_field(&self, name: &str, value: Value) {
            self.failing_fields
                .lock()
                .unwrap()
                .push((name.to_string(), value));
        }

        pub fn heal_fields(&self) {
            self.failing_fields.lock().unwrap().clear();
        }

        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Hold every call until `resume`
        pub fn pause(&self) {
            self.paused.send_replace(true);
        }

        pub fn resume(&self) {
            self.paused.send_replace(false);
        }

        /// Commit creates but hold their replies until `release_replies`
        pub fn hold_replies(&self) {
            self.replies_held.send_replace(true);
        }

        pub fn release_replies(&self) {
            self.replies_held.send_replace(false);
        }

        /// Seed a record as if another client had created it
        pub fn insert(&self, collection: &str, record: Record) {
            self.records
                .lock()
                .unwrap()
                .push((collection.to_string(), record));
        }

        pub fn records(&self, collection: &str) -> Vec<Record> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| c == collection)
                .map(|(_, r)| r.clone())
                .collect()
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        async fn enter(&self, call: Call) -> Result<(), RemoteError> {
            let mut paused = self.paused.subscribe();
            let _ = paused.wait_for(|p| !*p).await;
            self.calls.lock().unwrap().push(call);
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(RemoteError::Unreachable("connection refused".to_string()));
            }
            Ok(())
        }

        fn check_key(&self, key: &str) -> Result<(), RemoteError> {
            if self.failing_keys.lock().unwrap().contains(key) {
                return Err(RemoteError::Rejected {
                    status: 500,
                    message: format!("injected failure for {}", key),
                });
            }
            Ok(())
        }

        fn check_fields(&self, fields: &Fields) -> Result<(), RemoteError> {
            let failing = self.failing_fields.lock().unwrap();
            if failing.iter().any(|(name, value)| fields.get(name) == Some(value)) {
                return Err(RemoteError::Rejected {
                    status: 500,
                    message: "injected failure".to_string(),
                });
            }
            Ok(())
        }
    }

    impl RemoteStore for MemoryRemote {
        async fn create(&self, collection: &str, fields: &Fields) -> Result<String, RemoteError> {
            self.enter(Call::Create(collection.to_string())).await?;
            self.check_fields(fields)?;

            let key = self
                .assigned_keys
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
            self.insert(collection, Record::new(key.clone(), fields.clone()));

            let mut held = self.replies_held.subscribe();
            let _ = held.wait_for(|h| !*h).await;
            Ok(key)
        }

        async fn update(&self, collection: &str, key: &str, fields: &Fields) -> Result<(), RemoteError> {
            self.enter(Call::Update(collection.to_string(), key.to_string()))
                .await?;
            self.check_key(key)?;
            self.check_fields(fields)?;

            let mut records = self.records.lock().unwrap();
            let existing = records
                .iter_mut()
                .find(|(c, r)| c == collection && r.key == key)
                .ok_or_else(|| RemoteError::NotFound(format!("{}:{}", collection, key)))?;
            existing.1.fields = fields.clone();
            Ok(())
        }

        async fn delete(&self, collection: &str, key: &str) -> Result<(), RemoteError> {
            self.enter(Call::Delete(collection.to_string(), key.to_string()))
                .await?;
            self.check_key(key)?;

            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|(c, r)| !(c == collection && r.key == key));
            if records.len() == before {
                return Err(RemoteError::NotFound(format!("{}:{}", collection, key)));
            }
            Ok(())
        }

        async fn list(&self, collection: &str) -> Result<Vec<Record>, RemoteError> {
            self.enter(Call::List(collection.to_string())).await?;
            Ok(self.records(collection))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRemote;
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[test]
    fn test_http_remote_requires_base_url() {
        let result = HttpRemote::new(&RemoteConfig::default());
        assert!(matches!(result, Err(TillError::Config(_))));
    }

    #[test]
    fn test_http_remote_urls_are_encoded() {
        let remote =
            HttpRemote::with_base_url("https://api.example.com/v1/", Duration::from_secs(5)).unwrap();
        assert_eq!(remote.base_url(), "https://api.example.com/v1");
        assert_eq!(
            remote.collection_url("payments"),
            "https://api.example.com/v1/payments"
        );
        assert_eq!(
            remote.record_url("payments", "a/b c"),
            "https://api.example.com/v1/payments/a%2Fb%20c"
        );
    }

    #[tokio::test]
    async fn test_http_remote_unreachable() {
        // Nothing listens on port 9 of the loopback interface
        let remote =
            HttpRemote::with_base_url("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = remote.list("payments").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)));
    }

    #[test]
    fn test_list_response_shape() {
        let body = r#"[{"key": "srv-1", "fields": {"price": 10}}, {"key": "srv-2"}]"#;
        let records: Vec<Record> = serde_json::from_str(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("price"), Some(&json!(10)));
        assert!(records[1].fields.is_empty());
    }

    #[tokio::test]
    async fn test_memory_remote_crud() {
        let remote = MemoryRemote::new();
        remote.assign_next_key("srv-77");

        let key = remote
            .create("payments", &fields(json!({"price": 10})))
            .await
            .unwrap();
        assert_eq!(key, "srv-77");

        remote
            .update("payments", "srv-77", &fields(json!({"price": 12})))
            .await
            .unwrap();
        let listed = remote.list("payments").await.unwrap();
        assert_eq!(listed[0].field("price"), Some(&json!(12)));

        let missing = remote.update("payments", "nope", &Fields::new()).await;
        assert!(matches!(missing, Err(RemoteError::NotFound(_))));

        remote.delete("payments", "srv-77").await.unwrap();
        assert!(remote.list("payments").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_remote_failure_injection() {
        let remote = MemoryRemote::new();
        remote.fail_field("price", json!(13));
        assert!(remote
            .create("payments", &fields(json!({"price": 13})))
            .await
            .is_err());

        remote.insert("payments", Record::new("srv-1", Fields::new()));
        remote.fail_key("srv-1");
        assert!(remote.delete("payments", "srv-1").await.is_err());
        remote.heal_key("srv-1");
        assert!(remote.delete("payments", "srv-1").await.is_ok());

        remote.set_unreachable(true);
        assert!(matches!(
            remote.list("payments").await,
            Err(RemoteError::Unreachable(_))
        ));
    }
}

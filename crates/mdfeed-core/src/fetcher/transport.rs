//! The `Transport` trait -- the adapter interface for the remote API.
//!
//! Each concrete transport implements this trait. The trait is
//! intentionally object-safe so the engine can hold a single boxed
//! instance shared by every producer worker.

use async_trait::async_trait;
use mdfeed_db::models::RowSet;

use super::RemoteCallError;

/// One HTTP endpoint invocation, independent of which logical fetch method
/// it backs.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub endpoint: &'static str,
    pub params: Vec<(&'static str, String)>,
}

/// Adapter interface over the remote financial-data API.
///
/// Implementors translate one HTTP call into a [`RowSet`]. Retry,
/// rate-limiting, and symbol normalization all live outside this trait, in
/// `Fetcher::invoke`'s explicit middleware composition — a transport's only
/// job is the call itself.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `Box<dyn Transport>`
/// is usable directly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name, used in rate-limiter bucket keys and logs.
    fn name(&self) -> &str;

    /// Issue one remote call and parse the response into rows.
    async fn call(&self, request: RemoteRequest) -> Result<RowSet, RemoteCallError>;
}

// Compile-time assertion: Transport must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Transport) {}
};

/// The real collaborator: a `reqwest`-backed HTTP client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn name(&self) -> &str {
        "reqwest"
    }

    async fn call(&self, request: RemoteRequest) -> Result<RowSet, RemoteCallError> {
        let mut form: Vec<(&str, String)> = vec![("api_name", request.endpoint.to_string()), ("token", self.token.clone())];
        form.extend(request.params.iter().map(|(k, v)| (*k, v.clone())));

        let response = self
            .client
            .post(&self.base_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RemoteCallError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteCallError::Server {
                status: status.as_u16(),
                message: body,
            });
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| RemoteCallError::Network(e.to_string()))?;

        envelope.into_rows()
    }
}

/// The remote API's response envelope: a column list plus row-major item
/// arrays, the shape every endpoint shares.
#[derive(Debug, serde::Deserialize)]
struct ApiEnvelope {
    fields: Vec<String>,
    items: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    code: i32,
    #[serde(default)]
    msg: Option<String>,
}

impl ApiEnvelope {
    fn into_rows(self) -> Result<RowSet, RemoteCallError> {
        if self.code != 0 {
            return Err(RemoteCallError::Business(
                self.msg.unwrap_or_else(|| "unknown API error".to_string()),
            ));
        }

        let rows = self
            .items
            .into_iter()
            .map(|item| item.into_iter().map(json_to_scalar).collect())
            .collect();

        Ok(RowSet::new(self.fields, rows))
    }
}

fn json_to_scalar(value: serde_json::Value) -> mdfeed_db::models::ScalarValue {
    use mdfeed_db::models::ScalarValue;
    match value {
        serde_json::Value::Null => ScalarValue::Null,
        serde_json::Value::String(s) => ScalarValue::Text(s),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Integer(i)
            } else {
                ScalarValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        other => ScalarValue::Text(other.to_string()),
    }
}

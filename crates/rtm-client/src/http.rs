//! HTTP collaborator seam and the open-signature provider.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, RtmError};

/// JSON over HTTP. URLs are absolute; query parameters are passed separately.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<Value>;

    async fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value)
        -> Result<Value>;
}

/// reqwest-backed client that stamps the application credentials on every
/// request.
pub struct ReqwestHttp {
    client: reqwest::Client,
    app_id: String,
    app_key: String,
}

impl ReqwestHttp {
    pub fn new(app_id: impl Into<String>, app_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| RtmError::Http(e.to_string()))?;
        Ok(Self {
            client,
            app_id: app_id.into(),
            app_key: app_key.into(),
        })
    }

    async fn finish(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let resp = request
            .header("X-LC-Id", &self.app_id)
            .header("X-LC-Key", &self.app_key)
            .send()
            .await
            .map_err(|e| RtmError::Http(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RtmError::MalformedData(e.to_string()))?;
        if status.is_success() {
            return Ok(body);
        }
        let code = body
            .get("code")
            .and_then(Value::as_i64)
            .map(|c| c as i32)
            .unwrap_or(status.as_u16() as i32);
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        Err(RtmError::Server {
            code,
            reason,
            app_code: None,
            app_message: None,
            detail: None,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<Value> {
        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        self.finish(request).await
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> Result<Value> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        self.finish(request).await
    }
}

/// Open-command signature.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Signature {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

/// Supplies a fresh signature for a session open.
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    async fn open_signature(&self, client_id: &str) -> Result<Signature>;
}

/// Signs opens with a user session token via `POST /rtm/sign`.
pub struct UserSessionSigner {
    http: Arc<dyn HttpClient>,
    api_server: String,
    user_session_token: String,
}

impl UserSessionSigner {
    pub fn new(
        http: Arc<dyn HttpClient>,
        api_server: impl Into<String>,
        user_session_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_server: api_server.into(),
            user_session_token: user_session_token.into(),
        }
    }
}

#[async_trait]
impl SignatureProvider for UserSessionSigner {
    async fn open_signature(&self, _client_id: &str) -> Result<Signature> {
        let url = api_url(&self.api_server, "/rtm/sign");
        let body = serde_json::json!({ "session_token": self.user_session_token });
        let value = self.http.post_json(&url, &[], &body).await?;
        serde_json::from_value(value)
            .map_err(|e| RtmError::MalformedData(format!("sign response: {e}")))
    }
}

/// Join the API server root, version prefix and a path.
pub fn api_url(api_server: &str, path: &str) -> String {
    format!("{}/1.1{}", api_server.trim_end_matches('/'), path)
}

use crate::config::Config;
use crate::error::{ModeldError, Result};
use crate::http::{ErrorReply, Reply, StatsReport};
use crate::models::{ArtifactVersion, ModelDetails, ModelRecord};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// HTTP client for talking to a running daemon
pub struct HttpClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpClient {
    /// Create new HTTP client for `base_url` (e.g. `http://127.0.0.1:3000`)
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ModeldError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Client for the daemon described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let bind = &config.server.bind;
        let host = bind
            .strip_prefix("0.0.0.0:")
            .map_or_else(|| bind.clone(), |port| format!("127.0.0.1:{port}"));
        Self::new(format!("http://{host}"))
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list(&self) -> Result<Vec<ModelRecord>> {
        self.get_json("/models").await
    }

    pub async fn status(&self, key: &str) -> Result<ModelDetails> {
        self.get_json(&format!("/models/{key}")).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/models/{key}")))
            .send()
            .await
            .map_err(Self::connect_error)?;
        Self::decode::<String>(response).await.map(|_| ())
    }

    /// Upload a model bundle with its metadata and io_params documents
    pub async fn load(
        &self,
        key: &str,
        model: &Path,
        metadata: &Path,
        io_params: &Path,
    ) -> Result<Reply<String>> {
        let form = Form::new()
            .part("model", file_part(model).await?)
            .part("metadata", file_part(metadata).await?)
            .part("io_params", file_part(io_params).await?);
        self.post_form(&format!("/load/{key}"), form).await
    }

    /// Upload a dataset and train synchronously
    pub async fn train(&self, key: &str, training_data: &Path, io_params: &Path) -> Result<Reply<String>> {
        let form = Form::new()
            .part("training_data", file_part(training_data).await?)
            .part("io_params", file_part(io_params).await?);
        self.post_form(&format!("/train/{key}"), form).await
    }

    pub async fn eval(&self, key: &str, payload: &Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(&format!("/eval/{key}")))
            .json(payload)
            .send()
            .await
            .map_err(Self::connect_error)?;
        Ok(Self::decode::<Value>(response).await?.msg)
    }

    /// Download the zip package of every version of `key`
    pub async fn export(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("/export/{key}")))
            .send()
            .await
            .map_err(Self::connect_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ModeldError::Http(format!("Failed to read archive: {e}")))?;
        Ok(bytes.to_vec())
    }

    pub async fn import(&self, key: &str, archive: Vec<u8>) -> Result<Vec<ArtifactVersion>> {
        let response = self
            .http
            .post(self.url(&format!("/import/{key}")))
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(archive)
            .send()
            .await
            .map_err(Self::connect_error)?;
        Ok(Self::decode(response).await?.msg)
    }

    pub async fn stats(&self) -> Result<StatsReport> {
        self.get_json("/stats").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(Self::connect_error)?;
        Ok(Self::decode(response).await?.msg)
    }

    async fn post_form(&self, path: &str, form: Form) -> Result<Reply<String>> {
        let response = self
            .http
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .map_err(Self::connect_error)?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<Reply<T>> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json::<Reply<T>>()
            .await
            .map_err(|e| ModeldError::Http(format!("Invalid response: {e}")))
    }

    async fn error_from(response: reqwest::Response) -> ModeldError {
        let status = response.status();
        match response.json::<ErrorReply>().await {
            Ok(body) => ModeldError::Http(format!("{} ({}): {}", status, body.error, body.msg)),
            Err(_) => ModeldError::Http(format!("Request failed with {status}")),
        }
    }

    fn connect_error(e: reqwest::Error) -> ModeldError {
        ModeldError::Http(format!("Could not reach daemon: {e}"))
    }
}

async fn file_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        ModeldError::MissingInput(format!("Cannot read {}: {e}", path.display()))
    })?;
    let file_name = path
        .file_name()
        .map_or_else(|| "upload".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(Part::bytes(bytes).file_name(file_name))
}

//! [`InferenceService`] backed by a local Ollama HTTP endpoint.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use quarry_runtime::{
    ImportRequest, InferenceService, ServiceError, ServiceModel, ServiceState, ServiceStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::ConfigError;
use crate::http_client;

const LLAMA3_TEMPLATE: &str = "{{- if .System }}<|start_header_id|>system<|end_header_id|>\n\n{{ .System }}<|eot_id|>{{- end }}<|start_header_id|>user<|end_header_id|>\n\n{{ .Prompt }}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";
const LLAMA3_STOPS: [&str; 3] = ["<|start_header_id|>", "<|end_header_id|>", "<|eot_id|>"];
const CHATML_TEMPLATE: &str = "{{- if .System }}<|im_start|>system\n{{ .System }}<|im_end|>\n{{- end }}<|im_start|>user\n{{ .Prompt }}<|im_end|>\n<|im_start|>assistant\n";
const CHATML_STOPS: [&str; 2] = ["<|im_start|>", "<|im_end|>"];

fn is_llama(model_name: &str) -> bool {
    model_name.to_ascii_lowercase().contains("llama")
}

/// Prompt template for a model: Llama-3 headers for llama models, ChatML otherwise.
pub fn chat_template(model_name: &str) -> &'static str {
    if is_llama(model_name) {
        LLAMA3_TEMPLATE
    } else {
        CHATML_TEMPLATE
    }
}

pub fn default_parameters(model_name: &str) -> BTreeMap<String, Value> {
    let stops: &[&str] = if is_llama(model_name) {
        &LLAMA3_STOPS
    } else {
        &CHATML_STOPS
    };
    let mut params = BTreeMap::new();
    params.insert("stop".to_string(), json!(stops));
    params.insert("temperature".to_string(), json!(0.7));
    params.insert("top_p".to_string(), json!(0.9));
    params
}

/// Pull the sha256 of the weights blob out of a modelfile's `FROM` line.
pub fn digest_from_modelfile(modelfile: &str) -> Option<String> {
    modelfile
        .lines()
        .map(str::trim)
        .filter(|l| l.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("FROM ")))
        .find_map(|line| {
            let idx = line.find("sha256-").or_else(|| line.find("sha256:"))?;
            let hex: String = line[idx + 7..]
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            (hex.len() == 64).then(|| hex.to_ascii_lowercase())
        })
}

fn map_send_err(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        ServiceError::Unavailable(err.to_string())
    } else if err.is_decode() {
        ServiceError::Protocol(err.to_string())
    } else {
        ServiceError::Unavailable(err.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ServiceError::NotFound(message));
    }
    Err(ServiceError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

pub struct OllamaService {
    base_url: String,
    client: reqwest::Client,
    import_client: reqwest::Client,
}

impl OllamaService {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        import_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: http_client::client_with_timeout(request_timeout)?,
            import_client: http_client::client_with_timeout(import_timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn blob_exists(&self, digest: &str) -> Result<bool, ServiceError> {
        let resp = self
            .client
            .head(self.url(&format!("/api/blobs/sha256:{digest}")))
            .send()
            .await
            .map_err(map_send_err)?;
        Ok(resp.status().is_success())
    }

    async fn upload_blob(&self, path: &Path, digest: &str) -> Result<(), ServiceError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ServiceError::Io(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))?
            .len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let resp = self
            .import_client
            .post(self.url(&format!("/api/blobs/sha256:{digest}")))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(map_send_err)?;
        check_status(resp).await?;
        debug!(digest, bytes = len, "uploaded blob");
        Ok(())
    }
}

#[async_trait::async_trait]
impl InferenceService for OllamaService {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn health(&self) -> Result<ServiceStatus, ServiceError> {
        let started = Instant::now();
        let resp = self
            .client
            .get(self.url("/api/version"))
            .send()
            .await
            .map_err(map_send_err)?;
        let resp = check_status(resp).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        let mut status = ServiceStatus::new(&self.base_url, ServiceState::Ready)
            .with_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
        if let Some(v) = body.get("version").and_then(Value::as_str) {
            status = status.with_version(v);
        }
        Ok(status)
    }

    async fn list(&self) -> Result<Vec<ServiceModel>, ServiceError> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(map_send_err)?;
        let tags: TagsResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        Ok(tags
            .models
            .into_iter()
            .map(|t| ServiceModel {
                name: t.name,
                digest: t.digest,
                source_digest: None,
                size: t.size,
            })
            .collect())
    }

    async fn describe(&self, name: &str) -> Result<Option<ServiceModel>, ServiceError> {
        let resp = self
            .client
            .post(self.url("/api/show"))
            .json(&json!({ "model": name }))
            .send()
            .await
            .map_err(map_send_err)?;
        let resp = match check_status(resp).await {
            Ok(resp) => resp,
            Err(ServiceError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        let source_digest = body
            .get("modelfile")
            .and_then(Value::as_str)
            .and_then(digest_from_modelfile);
        Ok(Some(ServiceModel {
            source_digest,
            ..ServiceModel::named(name)
        }))
    }

    async fn import(&self, req: &ImportRequest) -> Result<(), ServiceError> {
        let digest = req.sha256.to_ascii_lowercase();
        if !self.blob_exists(&digest).await? {
            self.upload_blob(&req.artifact_path, &digest).await?;
        }
        let basename = req
            .artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{digest}.gguf"));
        let mut body = json!({
            "model": req.name,
            "files": { basename: format!("sha256:{digest}") },
            "stream": false,
        });
        if let Some(template) = &req.template {
            body["template"] = json!(template);
        }
        if !req.parameters.is_empty() {
            body["parameters"] = json!(req.parameters);
        }
        let resp = self
            .import_client
            .post(self.url("/api/create"))
            .json(&body)
            .send()
            .await
            .map_err(map_send_err)?;
        let resp = check_status(resp).await?;
        let reply: Value = resp.json().await.unwrap_or(Value::Null);
        if let Some(err) = reply.get("error").and_then(Value::as_str) {
            return Err(ServiceError::Rejected {
                status: 200,
                message: err.to_string(),
            });
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        let resp = self
            .client
            .delete(self.url("/api/delete"))
            .json(&json!({ "model": name }))
            .send()
            .await
            .map_err(map_send_err)?;
        check_status(resp).await.map(|_| ())
    }
}

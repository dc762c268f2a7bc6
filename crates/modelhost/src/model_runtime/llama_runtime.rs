//! llama.cpp Runtime Adapter
//!
//! Hosts GGUF models through `llama-server`. The adapter either spawns a
//! server process for the artifact or, when `parameters.extra.endpoint` is
//! set, attaches to one that is already running. Requests are proxied over
//! the server's OpenAI-compatible chat completions API.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::format_detector::FormatDetector;
use super::runtime_trait::*;
use crate::error::{LoadError, PredictError};
use crate::settings::ModelSettings;
use crate::types::{
    Datatype, InferenceRequest, InferenceResponse, MetadataModelResponse, NamedTensor,
    Parameters, TensorData, TensorMetadata,
};

pub const LLAMA_BIN_ENV: &str = "LLAMA_BIN";
pub const CONTENT_OUTPUT: &str = "content";

const SERVER_BINARY: &str = "llama-server";
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_CTX_SIZE: u64 = 4096;
const DEFAULT_BATCH_SIZE: u64 = 512;

pub struct LlamaAdapter {
    binary: Option<PathBuf>,
    http_client: reqwest::Client,
    startup_timeout: Duration,
}

impl LlamaAdapter {
    /// Looks for `llama-server` in `$LLAMA_BIN`, then on `PATH`.
    pub fn discover() -> Self {
        let binary = std::env::var(LLAMA_BIN_ENV)
            .ok()
            .map(PathBuf::from)
            .filter(|path| path.is_file())
            .or_else(|| which::which(SERVER_BINARY).ok());
        match &binary {
            Some(path) => info!("Found {} at {}", SERVER_BINARY, path.display()),
            None => debug!("{} not found; GGUF models need an endpoint", SERVER_BINARY),
        }
        Self::with_binary(binary)
    }

    pub fn with_binary(binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    async fn is_healthy(&self, base_url: &str) -> bool {
        let health_url = format!("{}/health", base_url);
        match self.http_client.get(&health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn attach(&self, settings: &ModelSettings, endpoint: &str) -> Result<LlamaModel, LoadError> {
        let base_url = endpoint.trim_end_matches('/').to_string();
        if !self.is_healthy(&base_url).await {
            return Err(LoadError::unavailable(
                ModelFormat::Gguf,
                format!("llama-server at {} is not healthy", base_url),
            ));
        }
        info!("Attached {} to llama-server at {}", settings.key(), base_url);
        Ok(LlamaModel::new(settings.clone(), self.http_client.clone(), base_url, None))
    }

    async fn spawn(&self, settings: &ModelSettings, binary: &Path) -> Result<LlamaModel, LoadError> {
        let path = settings.parameters.artifact_path()?;
        check_gguf_artifact(&path).await?;

        let port = free_port().map_err(|e| {
            LoadError::unavailable(ModelFormat::Gguf, format!("no free port: {}", e))
        })?;
        let extra = |key: &str, default: u64| {
            settings
                .parameters
                .extra
                .get(key)
                .and_then(Value::as_u64)
                .unwrap_or(default)
        };
        let ctx_size = extra("ctx_size", DEFAULT_CTX_SIZE);
        let gpu_layers = extra("n_gpu_layers", 0);

        info!("Starting llama-server for GGUF model: {}", path.display());
        info!("  Binary: {}", binary.display());
        info!("  Port: {}", port);
        info!("  Context Size: {}", ctx_size);
        info!("  GPU Layers: {}", gpu_layers);

        let mut cmd = Command::new(binary);
        cmd.arg("--model").arg(&path)
            .arg("--host").arg("127.0.0.1")
            .arg("--port").arg(port.to_string())
            .arg("--ctx-size").arg(ctx_size.to_string())
            .arg("--batch-size").arg(extra("batch_size", DEFAULT_BATCH_SIZE).to_string())
            .arg("--threads").arg(extra("threads", num_cpus::get() as u64).to_string())
            .arg("--n-gpu-layers").arg(gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            LoadError::unavailable(ModelFormat::Gguf, format!("failed to spawn llama-server: {}", e))
        })?;
        // Owned by the model from here on so a cancelled load still kills it.
        let model = LlamaModel::new(
            settings.clone(),
            self.http_client.clone(),
            format!("http://127.0.0.1:{}", port),
            Some(child),
        );

        let started = Instant::now();
        loop {
            if let Some(status) = model.server_exit_status() {
                return Err(LoadError::corrupt(
                    &path,
                    format!("llama-server exited during startup ({})", status),
                ));
            }
            if self.is_healthy(&model.base_url).await {
                info!(
                    "GGUF runtime ready for {} after {:.1}s",
                    settings.key(),
                    started.elapsed().as_secs_f32()
                );
                return Ok(model);
            }
            if started.elapsed() >= self.startup_timeout {
                return Err(LoadError::unavailable(
                    ModelFormat::Gguf,
                    format!(
                        "llama-server failed to start within {}s",
                        self.startup_timeout.as_secs()
                    ),
                ));
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

impl Default for LlamaAdapter {
    fn default() -> Self {
        Self::discover()
    }
}

/// Missing file, empty file and non-GGUF contents are rejected before any
/// process is started.
async fn check_gguf_artifact(path: &Path) -> Result<(), LoadError> {
    let owned = path.to_path_buf();
    let head = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        use std::io::Read;
        let mut head = Vec::with_capacity(4);
        std::fs::File::open(&owned)?.take(4).read_to_end(&mut head)?;
        Ok(head)
    })
    .await
    .map_err(|e| LoadError::corrupt(path, format!("artifact check failed: {}", e)))?;

    match head {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(LoadError::ArtifactNotFound(path.to_path_buf()))
        }
        Err(e) => Err(LoadError::corrupt(path, e)),
        Ok(head) if head.is_empty() => Err(LoadError::corrupt(path, "artifact is empty")),
        Ok(head) if !FormatDetector::has_gguf_magic(&head) => {
            Err(LoadError::corrupt(path, "missing GGUF magic"))
        }
        Ok(_) => Ok(()),
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl ModelAdapter for LlamaAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn is_available(&self) -> bool {
        self.binary.as_deref().is_some_and(Path::is_file)
    }

    async fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn LoadedModel>, LoadError> {
        let model = match (settings.parameters.extra_str("endpoint"), &self.binary) {
            (Some(endpoint), _) => self.attach(settings, endpoint).await?,
            (None, Some(binary)) => self.spawn(settings, binary).await?,
            (None, None) => {
                return Err(LoadError::unavailable(
                    ModelFormat::Gguf,
                    format!("{} not found and no endpoint configured", SERVER_BINARY),
                ))
            }
        };
        Ok(Arc::new(model))
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            format: ModelFormat::Gguf,
            runtime_name: "llama.cpp (llama-server)".to_string(),
            version: "latest".to_string(),
            supports_streaming: true,
        }
    }
}

pub struct LlamaModel {
    settings: ModelSettings,
    http_client: reqwest::Client,
    base_url: String,
    /// Present only when this model spawned its own server.
    server_process: Mutex<Option<Child>>,
    unloaded: AtomicBool,
}

impl LlamaModel {
    fn new(
        settings: ModelSettings,
        http_client: reqwest::Client,
        base_url: String,
        server_process: Option<Child>,
    ) -> Self {
        Self {
            settings,
            http_client,
            base_url,
            server_process: Mutex::new(server_process),
            unloaded: AtomicBool::new(false),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Builds the chat completions body. The single BYTES input holds one
    /// message per element; the role comes from the tensor's parameters.
    fn chat_payload(&self, request: &InferenceRequest, stream: bool) -> Result<Value, PredictError> {
        if self.unloaded.load(Ordering::Acquire) {
            return Err(PredictError::PredictionFailed(format!(
                "model {} is unloaded",
                self.settings.key()
            )));
        }

        let input = match request.inputs.as_slice() {
            [input] => input,
            inputs => {
                return Err(PredictError::ShapeMismatch(format!(
                    "chat models take exactly 1 input tensor, got {}",
                    inputs.len()
                )))
            }
        };
        if input.datatype != Datatype::Bytes {
            return Err(PredictError::DatatypeMismatch(format!(
                "input '{}' is {}, expected BYTES",
                input.name,
                input.datatype.as_str()
            )));
        }
        input.validate()?;

        let role = input.parameter_str("role").unwrap_or("user");
        let TensorData::Bytes(contents) = &input.data else {
            return Err(PredictError::DatatypeMismatch(format!(
                "input '{}' carries non-text data",
                input.name
            )));
        };
        let messages: Vec<Value> = contents
            .iter()
            .map(|content| json!({ "role": role, "content": content }))
            .collect();

        if let Some(outputs) = request.requested_outputs() {
            if let Some(other) = outputs.into_iter().find(|name| *name != CONTENT_OUTPUT) {
                return Err(PredictError::UnknownOutput(format!(
                    "'{}' (available: {})",
                    other, CONTENT_OUTPUT
                )));
            }
        }

        let mut payload = json!({
            "model": self.settings.name,
            "messages": messages,
            "stream": stream,
        });
        for key in ["max_tokens", "temperature"] {
            if let Some(value) = request.parameter(key) {
                payload[key] = value.clone();
            }
        }
        Ok(payload)
    }

    fn response(&self, id: &str, content: String, finish_reason: Option<&str>) -> InferenceResponse {
        let parameters = finish_reason.map(|reason| {
            let mut parameters = Parameters::new();
            parameters.insert("finish_reason".to_string(), json!(reason));
            parameters
        });
        InferenceResponse {
            model_name: self.settings.name.clone(),
            model_version: Some(self.settings.version.clone()),
            id: Some(id.to_string()),
            parameters,
            outputs: vec![NamedTensor::new(
                CONTENT_OUTPUT,
                vec![1],
                TensorData::Bytes(vec![content]),
            )],
        }
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, PredictError> {
        let resp = self
            .http_client
            .post(self.completions_url())
            .json(payload)
            .send()
            .await
            .map_err(|e| PredictError::PredictionFailed(format!("inference request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PredictError::PredictionFailed(format!(
                "inference failed ({}): {}",
                status, body
            )));
        }
        Ok(resp)
    }

    fn server_exit_status(&self) -> Option<ExitStatus> {
        let mut guard = match self.server_process.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_mut()?.try_wait().ok().flatten()
    }

    fn shutdown_server(&self) {
        let child = match self.server_process.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut child) = child {
            match child.kill() {
                Ok(_) => {
                    info!("llama-server process for {} killed", self.settings.key());
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to kill llama-server process: {}", e),
            }
        }
    }
}

fn request_id(request: &InferenceRequest) -> String {
    request
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[async_trait]
impl LoadedModel for LlamaModel {
    fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn metadata(&self) -> MetadataModelResponse {
        MetadataModelResponse {
            name: self.settings.name.clone(),
            versions: vec![self.settings.version.clone()],
            platform: "llama.cpp".to_string(),
            inputs: vec![TensorMetadata::new("messages", Datatype::Bytes, vec![-1])],
            outputs: vec![TensorMetadata::new(CONTENT_OUTPUT, Datatype::Bytes, vec![1])],
        }
    }

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse, PredictError> {
        let payload = self.chat_payload(&request, false)?;
        let body: Value = self
            .send(&payload)
            .await?
            .json()
            .await
            .map_err(|e| PredictError::PredictionFailed(format!("failed to parse response: {}", e)))?;

        let choice = &body["choices"][0];
        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| PredictError::PredictionFailed("response has no message content".into()))?
            .to_string();

        Ok(self.response(&request_id(&request), content, choice["finish_reason"].as_str()))
    }

    fn predict_stream(self: Arc<Self>, request: InferenceRequest) -> ResponseStream {
        Box::pin(delta_stream(self, request))
    }

    async fn unload(&self) {
        if !self.unloaded.swap(true, Ordering::AcqRel) {
            self.shutdown_server();
            info!("Unloaded GGUF model {}", self.settings.key());
        }
    }
}

/// One response per generated delta; the last one carries `finish_reason`.
fn delta_stream(
    model: Arc<LlamaModel>,
    request: InferenceRequest,
) -> impl Stream<Item = Result<InferenceResponse, PredictError>> + Send + 'static {
    async_stream::try_stream! {
        let payload = model.chat_payload(&request, true)?;
        let id = request_id(&request);
        let byte_stream = model.send(&payload).await?.bytes_stream();

        let mut buffer = BytesMut::new();
        futures_util::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result
                .map_err(|e| PredictError::PredictionFailed(format!("stream read error: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(line) = next_line(&mut buffer)? {
                let data = match line.strip_prefix("data:") {
                    Some(data) => data.trim(),
                    None => continue,
                };
                if data == "[DONE]" {
                    return;
                }

                let event: Value = serde_json::from_str(data).map_err(|e| {
                    PredictError::PredictionFailed(format!("malformed stream chunk: {}", e))
                })?;
                let choice = &event["choices"][0];
                let delta = choice["delta"]["content"].as_str().unwrap_or_default();
                let finish_reason = choice["finish_reason"].as_str();
                if delta.is_empty() && finish_reason.is_none() {
                    continue;
                }
                yield model.response(&id, delta.to_string(), finish_reason);
            }
        }
    }
}

/// Splits one complete line off the front of `buffer`. Bytes are decoded only
/// once the whole line has arrived, so a character split across network
/// chunks survives intact.
fn next_line(buffer: &mut BytesMut) -> Result<Option<String>, PredictError> {
    let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let line = buffer.split_to(newline_pos + 1);
    let text = std::str::from_utf8(&line)
        .map_err(|e| PredictError::PredictionFailed(format!("stream chunk is not UTF-8: {}", e)))?;
    Ok(Some(text.trim().to_string()))
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        self.shutdown_server();
    }
}

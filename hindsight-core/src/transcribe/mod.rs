//! HTTP transcription client and backend configuration.
//!
//! The engine never runs inference in-process: finished recordings are
//! posted to an external speech-to-text HTTP endpoint as
//! `multipart/form-data` (file field `file`, `response_format=json`) and
//! the JSON response yields the transcript text plus a language code.
//! Backends are tagged variants validated at engine init, not stringly
//! configured at call time.

pub mod dispatcher;
pub mod merge;

use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{HindsightError, Result};

/// Where transcription requests go.
#[derive(Debug, Clone)]
pub enum TranscriptionBackend {
    /// A whisper-server style endpoint: `POST <url><inference_path>`,
    /// no authentication.
    Local { url: String, inference_path: String },
    /// An OpenAI-compatible endpoint: `POST <url>/audio/transcriptions`
    /// with a bearer key and a model name.
    OpenAiCompat {
        url: String,
        api_key: String,
        model: String,
    },
}

impl Default for TranscriptionBackend {
    fn default() -> Self {
        Self::Local {
            url: "http://localhost:8080".into(),
            inference_path: "/inference".into(),
        }
    }
}

impl TranscriptionBackend {
    /// Server root, probed by `health()`.
    pub fn base_url(&self) -> &str {
        match self {
            Self::Local { url, .. } => url,
            Self::OpenAiCompat { url, .. } => url,
        }
    }

    fn endpoint(&self) -> String {
        match self {
            Self::Local {
                url,
                inference_path,
            } => format!("{}{}", url.trim_end_matches('/'), inference_path),
            Self::OpenAiCompat { url, .. } => {
                format!("{}/audio/transcriptions", url.trim_end_matches('/'))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.base_url();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(HindsightError::Config(format!(
                "transcription backend url must be http(s): {url}"
            )));
        }
        if let Self::OpenAiCompat { api_key, model, .. } = self {
            if api_key.is_empty() {
                return Err(HindsightError::Config(
                    "openai-compatible backend requires an api key".into(),
                ));
            }
            if model.is_empty() {
                return Err(HindsightError::Config(
                    "openai-compatible backend requires a model name".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A completed transcription.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
}

/// Errors from a single transcription attempt, classified for retry.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("failed to read audio file: {0}")]
    File(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("endpoint returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl TranscribeError {
    /// Transient failures worth another attempt: network errors, timeouts,
    /// rate limiting, and 5xx responses. Client errors and unreadable
    /// files are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::File(_) | Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

/// Reusable HTTP client for one configured backend.
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    http: reqwest::Client,
    backend: TranscriptionBackend,
}

impl TranscriptionClient {
    pub fn new(backend: TranscriptionBackend) -> Result<Self> {
        backend.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| HindsightError::Config(e.to_string()))?;
        Ok(Self { http, backend })
    }

    pub fn backend(&self) -> &TranscriptionBackend {
        &self.backend
    }

    /// One transcription attempt with the given request timeout.
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        timeout: Duration,
    ) -> std::result::Result<Transcript, TranscribeError> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| TranscribeError::File(e.to_string()))?;
        let filename = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        debug!(
            file = %filename,
            bytes = bytes.len(),
            endpoint = %self.backend.endpoint(),
            "sending transcription request"
        );

        let file_part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str("audio/wav")
            .map_err(|e| TranscribeError::Parse(e.to_string()))?;
        let mut form = Form::new()
            .part("file", file_part)
            .text("response_format", "json")
            .text("temperature", "0");
        if let TranscriptionBackend::OpenAiCompat { model, .. } = &self.backend {
            form = form.text("model", model.clone());
        }

        let mut request = self
            .http
            .post(self.backend.endpoint())
            .timeout(timeout)
            .multipart(form);
        if let TranscriptionBackend::OpenAiCompat { api_key, .. } = &self.backend {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TranscribeError::Timeout
            } else {
                TranscribeError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TranscribeError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: InferenceResponse = response
            .json()
            .await
            .map_err(|e| TranscribeError::Parse(e.to_string()))?;

        info!(
            chars = parsed.text.len(),
            language = parsed.language.as_deref().unwrap_or("unknown"),
            "transcription succeeded"
        );
        Ok(Transcript {
            text: parsed.text.trim().to_string(),
            language: parsed.language,
        })
    }

    /// Cheap readiness probe against the server root. Used at startup to
    /// warn the operator when the backend is down; never fatal.
    pub async fn health(&self) -> bool {
        match self
            .http
            .get(self.backend.base_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!("transcription backend health probe failed: {e}");
                false
            }
        }
    }
}

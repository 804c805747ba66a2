use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::progress::{PercentTracker, ProgressSink};
use crate::types::{FileCandidate, ProgressEvent};
use crate::{Error, Result};

pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub server_path: String,
}

pub trait Transfer: Send + Sync {
    fn endpoint(&self) -> &str;

    fn transfer<'a>(
        &'a self,
        candidate: &'a FileCandidate,
        upload_id: &'a str,
        progress: Arc<dyn ProgressSink>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferReceipt>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransferConfig {
    pub upload_url: String,
    pub form_field: String,
    pub content_type: String,
    pub timeout: Duration,
}

impl Default for HttpTransferConfig {
    fn default() -> Self {
        Self {
            upload_url: "http://127.0.0.1:64451/api/upload/video".to_string(),
            form_field: "file".to_string(),
            content_type: "video/mp4".to_string(),
            timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

pub struct HttpTransfer {
    config: HttpTransferConfig,
    client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new(config: HttpTransferConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

impl Transfer for HttpTransfer {
    fn endpoint(&self) -> &str {
        &self.config.upload_url
    }

    fn transfer<'a>(
        &'a self,
        candidate: &'a FileCandidate,
        upload_id: &'a str,
        progress: Arc<dyn ProgressSink>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferReceipt>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(&candidate.path)
                .await
                .map_err(|e| Error::Read {
                    path: PathBuf::from(&candidate.path),
                    message: e.to_string(),
                })?;
            let total = bytes.len() as u64;
            debug!(
                event = "io.upload.request",
                upload_id,
                url = %self.config.upload_url,
                bytes = total,
                "io.upload.request"
            );

            let body = progress_body(bytes, upload_id.to_string(), progress);
            let part = reqwest::multipart::Part::stream_with_length(body, total)
                .file_name(candidate.name.clone())
                .mime_str(&self.config.content_type)
                .map_err(|e| Error::InvalidConfig {
                    message: format!("invalid content type: {e}"),
                })?;
            let form = reqwest::multipart::Form::new().part(self.config.form_field.clone(), part);

            let request = async {
                let res = self
                    .client
                    .post(&self.config.upload_url)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| Error::Transfer {
                        message: format!("request failed: {e}"),
                    })?;
                let status = res.status();
                let body = res.text().await.map_err(|e| Error::Transfer {
                    message: format!("read response failed: {e}"),
                })?;
                Ok::<_, Error>((status, body))
            };

            let (status, body) = tokio::time::timeout(self.config.timeout, request)
                .await
                .map_err(|_| Error::Transfer {
                    message: format!("upload timed out after {:?}", self.config.timeout),
                })??;

            debug!(
                event = "io.upload.response",
                upload_id,
                status = status.as_u16(),
                "io.upload.response"
            );
            parse_upload_response(status, &body, &candidate.path)
        })
    }
}

/// Feeds the file to the transport in chunks, reporting how much it has pulled.
fn progress_body(
    bytes: Vec<u8>,
    upload_id: String,
    sink: Arc<dyn ProgressSink>,
) -> reqwest::Body {
    let mut tracker = PercentTracker::new(bytes.len() as u64);
    if let Some(pct) = tracker.initial() {
        sink.on_progress(ProgressEvent {
            upload_id: upload_id.clone(),
            progress: pct,
        });
    }

    let chunks = futures_util::stream::unfold((bytes, 0usize), |(bytes, offset)| async move {
        if offset >= bytes.len() {
            return None;
        }
        let end = (offset + UPLOAD_CHUNK_BYTES).min(bytes.len());
        let chunk = bytes[offset..end].to_vec();
        Some((chunk, (bytes, end)))
    });

    let stream = chunks.map(move |chunk| {
        if let Some(pct) = tracker.advance(chunk.len() as u64) {
            sink.on_progress(ProgressEvent {
                upload_id: upload_id.clone(),
                progress: pct,
            });
        }
        Ok::<_, std::io::Error>(chunk)
    });

    reqwest::Body::wrap_stream(stream)
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    success: bool,
    file_path: Option<String>,
    error: Option<String>,
}

fn parse_upload_response(
    status: reqwest::StatusCode,
    body: &str,
    local_path: &str,
) -> Result<TransferReceipt> {
    if !status.is_success() {
        let reason = serde_json::from_str::<UploadResponse>(body)
            .ok()
            .and_then(|r| r.error)
            .unwrap_or_else(|| format!("http {status}: {body}"));
        return Err(Error::Transfer { message: reason });
    }

    let parsed: UploadResponse = serde_json::from_str(body).map_err(|e| Error::Transfer {
        message: format!("invalid json: {e}; body={body}"),
    })?;

    if !parsed.success {
        return Err(Error::Transfer {
            message: parsed
                .error
                .unwrap_or_else(|| "server reported failure".to_string()),
        });
    }

    // Servers that omit file_path get the local path back.
    let server_path = parsed
        .file_path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| local_path.to_string());
    Ok(TransferReceipt { server_path })
}

/// In-process transfer used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryTransfer {
    delay: Duration,
    failures: Mutex<HashMap<String, String>>,
    inner: Mutex<HashMap<String, FileCandidate>>,
}

impl InMemoryTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Makes every transfer of `path` fail with `reason`.
    pub async fn fail_path(&self, path: &str, reason: &str) {
        self.failures
            .lock()
            .await
            .insert(path.to_string(), reason.to_string());
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Transfer for InMemoryTransfer {
    fn endpoint(&self) -> &str {
        "test.mem"
    }

    fn transfer<'a>(
        &'a self,
        candidate: &'a FileCandidate,
        upload_id: &'a str,
        progress: Arc<dyn ProgressSink>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferReceipt>> + Send + 'a>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let failure = self.failures.lock().await.get(&candidate.path).cloned();
            if let Some(reason) = failure {
                progress.on_progress(ProgressEvent {
                    upload_id: upload_id.to_string(),
                    progress: 25,
                });
                return Err(Error::Transfer { message: reason });
            }

            for pct in [25u8, 50, 75, 100] {
                progress.on_progress(ProgressEvent {
                    upload_id: upload_id.to_string(),
                    progress: pct,
                });
                tokio::task::yield_now().await;
            }

            self.inner
                .lock()
                .await
                .insert(upload_id.to_string(), candidate.clone());
            Ok(TransferReceipt {
                server_path: format!("/srv/{}", candidate.name),
            })
        })
    }
}

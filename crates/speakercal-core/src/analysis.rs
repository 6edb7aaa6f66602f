//! Remote analysis service client
//!
//! Request/response only: one JSON POST per task to `{base}/task/{task}`,
//! the result is read from the response object under the task's name.
//! Nothing is retried; a caller wanting retry starts a new session.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from the analysis service
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Analysis request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Analysis service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Analysis response has no '{0}' result")]
    MissingResult(String),

    #[error("Malformed analysis result: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl AnalysisError {
    /// Taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "AnalysisRequestError",
            Self::Status { .. } => "AnalysisStatusError",
            Self::MissingResult(_) => "AnalysisMissingResultError",
            Self::Malformed(_) => "AnalysisMalformedError",
        }
    }
}

/// Task identifiers understood by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisTask {
    ImpulseResponse,
    InverseImpulseResponse,
    Volume,
}

impl AnalysisTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImpulseResponse => "impulse-response",
            Self::InverseImpulseResponse => "inverse-impulse-response",
            Self::Volume => "volume",
        }
    }
}

impl std::fmt::Display for AnalysisTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "impulse-response" => Ok(Self::ImpulseResponse),
            "inverse-impulse-response" => Ok(Self::InverseImpulseResponse),
            "volume" => Ok(Self::Volume),
            other => Err(format!("unknown analysis task '{}'", other)),
        }
    }
}

#[derive(Serialize)]
struct TaskRequest<'a, T: Serialize> {
    task: &'static str,
    payload: &'a [T],
    #[serde(rename = "sample-rate", skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
    #[serde(rename = "P", skip_serializing_if = "Option::is_none")]
    period: Option<usize>,
}

/// Client for the remote analysis service
#[derive(Debug, Clone)]
pub struct AnalysisClient {
    base_url: String,
    http: reqwest::Client,
}

impl AnalysisClient {
    /// Client for the service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, AnalysisError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Impulse response of a recorded MLS period
    pub async fn impulse_response(
        &self,
        recorded: &[f32],
        sample_rate: u32,
        period: usize,
    ) -> Result<Vec<f64>, AnalysisError> {
        self.run(
            AnalysisTask::ImpulseResponse,
            recorded,
            Some(sample_rate),
            Some(period),
        )
        .await
    }

    /// Inverse filter that cancels `impulse_response` when convolved with it
    pub async fn inverse_impulse_response(
        &self,
        impulse_response: &[f64],
    ) -> Result<Vec<f64>, AnalysisError> {
        self.run(
            AnalysisTask::InverseImpulseResponse,
            impulse_response,
            None,
            None,
        )
        .await
    }

    /// Sound level figure for a recording
    pub async fn volume(
        &self,
        recorded: &[f32],
        sample_rate: u32,
    ) -> Result<serde_json::Value, AnalysisError> {
        self.run(AnalysisTask::Volume, recorded, Some(sample_rate), None)
            .await
    }

    /// Send `payload` for `task` and return the raw result value
    pub async fn run<T: Serialize, R: DeserializeOwned>(
        &self,
        task: AnalysisTask,
        payload: &[T],
        sample_rate: Option<u32>,
        period: Option<usize>,
    ) -> Result<R, AnalysisError> {
        let url = format!("{}/task/{}", self.base_url, task);
        let body = TaskRequest {
            task: task.as_str(),
            payload,
            sample_rate,
            period,
        };

        tracing::info!(%task, samples = payload.len(), "Requesting analysis");
        let started = std::time::Instant::now();

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%task, status = status.as_u16(), "Analysis request rejected");
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut results: serde_json::Map<String, serde_json::Value> = response.json().await?;
        let result = results
            .remove(task.as_str())
            .ok_or_else(|| AnalysisError::MissingResult(task.to_string()))?;

        tracing::debug!(
            %task,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis finished"
        );
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn handler(Path(task): Path<String>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if body["task"] != task.as_str() {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "task mismatch"})));
        }
        let payload = body["payload"].as_array().cloned().unwrap_or_default();
        match task.as_str() {
            "impulse-response" => {
                let p = body["P"].as_u64().unwrap_or(0);
                let rate = body["sample-rate"].as_u64().unwrap_or(0);
                (
                    StatusCode::OK,
                    Json(json!({ "impulse-response": [payload.len() as u64, p, rate] })),
                )
            }
            "inverse-impulse-response" => {
                let has_meta = body.get("sample-rate").is_some() || body.get("P").is_some();
                let inverted: Vec<f64> = payload
                    .iter()
                    .map(|v| -v.as_f64().unwrap_or(0.0))
                    .collect();
                let status = if has_meta { StatusCode::BAD_REQUEST } else { StatusCode::OK };
                (status, Json(json!({ "inverse-impulse-response": inverted })))
            }
            "volume" if payload.is_empty() => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"error": "empty payload"})))
            }
            "volume" => (StatusCode::OK, Json(json!({ "other": 1 }))),
            _ => (StatusCode::NOT_FOUND, Json(json!({}))),
        }
    }

    async fn spawn_service() -> String {
        let app = Router::new().route("/task/{task}", post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_impulse_response_request_shape() {
        let client = AnalysisClient::new(spawn_service().await).unwrap();

        let result = client
            .impulse_response(&[0.1, 0.2, 0.3], 48000, 7)
            .await
            .unwrap();

        assert_eq!(result, vec![3.0, 7.0, 48000.0]);
    }

    #[tokio::test]
    async fn test_inverse_omits_metadata() {
        let client = AnalysisClient::new(spawn_service().await).unwrap();

        let result = client.inverse_impulse_response(&[1.0, -0.5]).await.unwrap();

        assert_eq!(result, vec![-1.0, 0.5]);
    }

    #[tokio::test]
    async fn test_missing_result_key() {
        let client = AnalysisClient::new(spawn_service().await).unwrap();

        let err = client.volume(&[0.0; 4], 48000).await.unwrap_err();

        assert!(matches!(err, AnalysisError::MissingResult(ref t) if t == "volume"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let client = AnalysisClient::new(spawn_service().await).unwrap();

        let err = client.volume(&[], 48000).await.unwrap_err();

        assert!(matches!(err, AnalysisError::Status { status: 422, .. }));
        assert_eq!(err.kind(), "AnalysisStatusError");
    }

    #[test]
    fn test_task_names() {
        assert_eq!(AnalysisTask::ImpulseResponse.as_str(), "impulse-response");
        assert_eq!(
            "inverse-impulse-response".parse::<AnalysisTask>(),
            Ok(AnalysisTask::InverseImpulseResponse)
        );
        assert!("loudness".parse::<AnalysisTask>().is_err());
    }
}

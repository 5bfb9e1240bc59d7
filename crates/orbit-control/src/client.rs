//! Control-plane client.
//!
//! This module provides the `ControlPlaneClient` seam used by every engine
//! component, the reqwest-backed `HttpControlPlaneClient`, and the
//! reauthenticate-once helper applied to every remote call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orbit_auth::Session;
use orbit_core::{ImageRef, OperationKind, TargetRef, TaskId};
use orbit_store::ComplianceStatus;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result, ValidationError};
use crate::types::{
    ComplianceReport, OperationParams, SubStep, TargetState, TaskError, TaskSnapshot, TaskStatus,
};

/// Trait for control-plane communication.
///
/// This trait abstracts the remote API, allowing for the in-memory
/// implementation in [`crate::mock`] during tests.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Submit an operation and return the issued task id.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateInFlight` if a task of the same kind is running for
    /// the target, `Validation` if the control plane rejects the request,
    /// `SessionExpired`, or `Transport`.
    async fn submit(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<TaskId>;

    /// Fetch the status and sub-steps of a task.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for an unknown id, `SessionExpired`, or
    /// `Transport`.
    async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot>;

    /// Resume a failed task from its last completed sub-step.
    ///
    /// # Errors
    ///
    /// Returns `NotRetryable` if the control plane refuses, `TaskNotFound`,
    /// `SessionExpired`, or `Transport`.
    async fn resume_task(&self, task_id: &TaskId) -> Result<TaskId>;

    /// List task ids of one kind, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired` or `Transport`.
    async fn list_tasks(
        &self,
        kind: OperationKind,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskId>>;

    /// Renew the session after the control plane rejected it.
    ///
    /// # Errors
    ///
    /// Returns `Auth` if a new session cannot be obtained.
    async fn reauthenticate(&self) -> Result<()>;

    /// Fetch the current state of a target. `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired` or `Transport`.
    async fn get_target(&self, target: &TargetRef) -> Result<Option<TargetState>>;

    /// Check whether an image is present in the control plane.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired` or `Transport`.
    async fn image_exists(&self, image: &ImageRef) -> Result<bool>;

    /// Fetch the latest compliance evaluation for a target.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired` or `Transport`.
    async fn get_compliance(&self, target: &TargetRef) -> Result<Option<ComplianceReport>>;
}

/// Run a remote call, reauthenticating and retrying once on session expiry.
///
/// A failed reauthentication is returned as-is. The retried call's result is
/// returned whatever it is.
///
/// # Errors
///
/// Returns the call's error, or the reauthentication error.
pub async fn with_reauth<T, F, Fut>(client: &dyn ControlPlaneClient, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    match call().await {
        Err(ControlError::SessionExpired) => {
            tracing::debug!("Control-plane session expired, reauthenticating");
            if let Err(e) = client.reauthenticate().await {
                tracing::error!(error = %e, "Reauthentication failed");
                return Err(e);
            }
            call().await
        }
        other => other,
    }
}

/// HTTP client for the control-plane REST API.
///
/// Every request carries a bearer token from the shared [`Session`].
#[derive(Clone)]
pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    session: Arc<Session>,
}

impl HttpControlPlaneClient {
    /// Create a new control-plane client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The control-plane base URL (e.g., `https://cp.example.com`)
    /// * `session` - Shared session providing bearer tokens
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, session: Arc<Session>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ControlError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, base_url, session))
    }

    /// Create a new control-plane client with a custom reqwest client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        session: Arc<Session>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    /// Get the base URL of the control plane.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn target_url(&self, target: &TargetRef) -> String {
        format!(
            "{}/v1/domains/{}/clusters/{}",
            self.base_url,
            target.domain_id(),
            target.cluster_id()
        )
    }

    /// Build an authenticated request.
    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.session.access_token().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ControlError::SessionExpired);
        }
        Ok(response)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| ControlError::Transport(format!("invalid response body: {e}")))
    }
}

/// Error body returned by the control plane.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Read a human-readable reason from an error response.
async fn error_message(response: Response) -> String {
    let status = response.status();
    response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| format!("control plane returned status {status}"))
}

fn unexpected(status: StatusCode, message: String) -> ControlError {
    ControlError::Transport(format!("HTTP {status}: {message}"))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTarget {
    domain_id: String,
    cluster_id: String,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    kind: &'static str,
    target: WireTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTask {
    id: String,
    kind: String,
    target: WireTarget,
    status: String,
    #[serde(default)]
    sub_tasks: Vec<WireSubTask>,
    #[serde(default)]
    error: Option<TaskError>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireSubTask {
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ElementsBody {
    #[serde(default)]
    elements: Vec<IdBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTargetState {
    #[serde(default)]
    current_image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCompliance {
    image: String,
    status: String,
    evaluated_at: DateTime<Utc>,
}

fn parse_task_id(raw: String) -> Result<TaskId> {
    TaskId::new(raw).map_err(|e| ControlError::Transport(format!("invalid task id: {e}")))
}

impl WireTask {
    fn into_snapshot(self) -> Result<TaskSnapshot> {
        let kind = self
            .kind
            .parse::<OperationKind>()
            .map_err(|e| ControlError::Transport(e.to_string()))?;
        let target = format!("{}/{}", self.target.domain_id, self.target.cluster_id)
            .parse::<TargetRef>()
            .map_err(|e| ControlError::Transport(format!("invalid target: {e}")))?;

        Ok(TaskSnapshot {
            id: parse_task_id(self.id)?,
            kind,
            target,
            status: TaskStatus::from_remote(&self.status),
            sub_steps: self
                .sub_tasks
                .into_iter()
                .map(|s| SubStep::new(s.name, TaskStatus::from_remote(&s.status)))
                .collect(),
            last_error: self.error,
            completed_at: self.completed_at,
        })
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn submit(
        &self,
        kind: OperationKind,
        target: &TargetRef,
        params: &OperationParams,
    ) -> Result<TaskId> {
        let url = format!("{}/v1/tasks", self.base_url);
        let body = SubmitBody {
            kind: kind.as_str(),
            target: WireTarget {
                domain_id: target.domain_id().to_string(),
                cluster_id: target.cluster_id().to_string(),
            },
            image: params.image.as_ref().map(ImageRef::as_str),
            source: params.source.as_deref(),
        };

        let response = Self::send(self.request(Method::POST, &url).await?.json(&body)).await?;

        match response.status() {
            s if s.is_success() => {
                let id: IdBody = Self::decode(response).await?;
                let task_id = parse_task_id(id.id)?;
                tracing::debug!(task_id = %task_id, kind = %kind, target_ref = %target, "Submitted task via control-plane API");
                Ok(task_id)
            }
            StatusCode::CONFLICT => Err(ControlError::DuplicateInFlight {
                kind,
                target: target.clone(),
            }),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(ControlError::Validation(ValidationError::Rejected {
                    message: error_message(response).await,
                }))
            }
            s => Err(unexpected(s, error_message(response).await)),
        }
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        let url = format!("{}/v1/tasks/{}", self.base_url, task_id);
        let response = Self::send(self.request(Method::GET, &url).await?).await?;

        match response.status() {
            s if s.is_success() => Self::decode::<WireTask>(response).await?.into_snapshot(),
            StatusCode::NOT_FOUND => Err(ControlError::TaskNotFound(task_id.clone())),
            s => Err(unexpected(s, error_message(response).await)),
        }
    }

    async fn resume_task(&self, task_id: &TaskId) -> Result<TaskId> {
        let url = format!("{}/v1/tasks/{}", self.base_url, task_id);
        let response = Self::send(self.request(Method::PATCH, &url).await?).await?;

        match response.status() {
            s if s.is_success() => {
                let id: IdBody = Self::decode(response).await?;
                parse_task_id(id.id)
            }
            StatusCode::NOT_FOUND => Err(ControlError::TaskNotFound(task_id.clone())),
            StatusCode::CONFLICT | StatusCode::BAD_REQUEST => Err(ControlError::NotRetryable {
                task_id: task_id.clone(),
                reason: error_message(response).await,
            }),
            s => Err(unexpected(s, error_message(response).await)),
        }
    }

    async fn list_tasks(
        &self,
        kind: OperationKind,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskId>> {
        let url = format!("{}/v1/tasks", self.base_url);
        let mut query = vec![("kind", kind.as_str())];
        if let Some(status) = status {
            query.push(("status", status.as_remote()));
        }

        let response = Self::send(self.request(Method::GET, &url).await?.query(&query)).await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(unexpected(status, error_message(response).await));
        }

        let body: ElementsBody = Self::decode(response).await?;
        body.elements
            .into_iter()
            .map(|e| parse_task_id(e.id))
            .collect()
    }

    async fn reauthenticate(&self) -> Result<()> {
        self.session.reauthenticate().await?;
        Ok(())
    }

    async fn get_target(&self, target: &TargetRef) -> Result<Option<TargetState>> {
        let url = self.target_url(target);
        let response = Self::send(self.request(Method::GET, &url).await?).await?;

        match response.status() {
            s if s.is_success() => {
                let state: WireTargetState = Self::decode(response).await?;
                let current_image = state
                    .current_image
                    .map(ImageRef::new)
                    .transpose()
                    .map_err(|e| ControlError::Transport(format!("invalid image: {e}")))?;
                Ok(Some(TargetState {
                    target: target.clone(),
                    current_image,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(unexpected(s, error_message(response).await)),
        }
    }

    async fn image_exists(&self, image: &ImageRef) -> Result<bool> {
        let url = format!("{}/v1/images/{}", self.base_url, image);
        let response = Self::send(self.request(Method::GET, &url).await?).await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(unexpected(s, error_message(response).await)),
        }
    }

    async fn get_compliance(&self, target: &TargetRef) -> Result<Option<ComplianceReport>> {
        let url = format!("{}/compliance", self.target_url(target));
        let response = Self::send(self.request(Method::GET, &url).await?).await?;

        match response.status() {
            s if s.is_success() => {
                let raw: WireCompliance = Self::decode(response).await?;
                Ok(Some(ComplianceReport {
                    image: ImageRef::new(raw.image)
                        .map_err(|e| ControlError::Transport(format!("invalid image: {e}")))?,
                    status: ComplianceStatus::from_remote(&raw.status),
                    evaluated_at: raw.evaluated_at,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(unexpected(s, error_message(response).await)),
        }
    }
}

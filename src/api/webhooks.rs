use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{DeployRequest, DeploymentTrigger, ServiceKind};
use crate::AppState;

use super::error::ApiError;

/// The part of a git push event the webhook cares about
#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    head_commit: Option<PushCommit>,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub deployed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// POST /api/deploy/:kind/:token
///
/// The refresh token in the URL is the only credential. Any token that
/// does not belong to a service is `unauthorized`, never `not found`.
pub async fn deploy_webhook(
    State(state): State<Arc<AppState>>,
    Path((kind, token)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let kind: ServiceKind = kind.parse().map_err(ApiError::bad_request)?;

    let service = state.engine.tokens().find_service_by_token(&token).await?;
    if service.get_kind() != kind {
        return Err(ApiError::bad_request(format!(
            "service is a {} service, not {}",
            service.kind, kind
        )));
    }
    if !service.auto_deploy_enabled() {
        return Err(ApiError::bad_request("Automatic deployments are disabled for this service"));
    }

    let event: Option<PushEvent> = serde_json::from_slice(&body).ok();
    let branch = event
        .as_ref()
        .and_then(|e| e.git_ref.as_deref())
        .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r));

    if let Some(branch) = branch {
        if branch != service.branch {
            tracing::info!(
                service_id = %service.id,
                pushed = %branch,
                configured = %service.branch,
                "Webhook ignored: branch mismatch"
            );
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    deployed: false,
                    deployment_id: None,
                    reason: Some(format!("branch {} is not deployed", branch)),
                }),
            ));
        }
    }

    // A push on the configured branch is an automatic deployment; a bare
    // call to the URL is a plain webhook trigger
    let trigger = if branch.is_some() {
        DeploymentTrigger::Autodeploy
    } else {
        DeploymentTrigger::Webhook
    };
    let description = event
        .and_then(|e| e.head_commit)
        .map(|c| c.message.lines().next().unwrap_or_default().to_string());
    let request = state
        .engine
        .enqueue(
            &service.id,
            trigger,
            DeployRequest {
                title: None,
                description,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            deployed: true,
            deployment_id: Some(request.deployment_id),
            reason: None,
        }),
    ))
}

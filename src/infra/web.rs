use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::{
    model::{Application, DeployRequest, DeploymentEvent},
    orchestrator::Reconciliation,
    DeployError, DeploymentService,
};

pub fn router(service: DeploymentService) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/deploy", post(create_deployment))
        .route("/apps", get(list_deployments))
        .route("/apps/:id", get(get_deployment).delete(delete_deployment))
        .route("/apps/:id/events", get(deployment_events))
        .route("/apps/:id/logs", get(deployment_logs))
        .route("/maintenance/prune-images", post(prune_images))
        .route("/maintenance/recover-containers", post(recover_containers))
        .with_state(Arc::new(service))
}

#[derive(Serialize)]
struct ApplicationView {
    #[serde(flatten)]
    app: Application,
    url: String,
}

impl From<Application> for ApplicationView {
    fn from(app: Application) -> Self {
        let url = format!("http://localhost:{}", app.port);
        Self { app, url }
    }
}

struct ApiError(DeployError);

impl From<DeployError> for ApiError {
    fn from(error: DeployError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DeployError::DuplicateId(_)
            | DeployError::PortInUse { .. }
            | DeployError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DeployError::NoFreePort { .. }
            | DeployError::RuntimeFailure(_)
            | DeployError::PersistenceFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeployError::BuildFailed(_) | DeployError::RunFailed(_) | DeployError::Timeout { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("Request failed : {}", self.0);
        } else {
            warn!("Request rejected : {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_deployment(
    State(service): State<Arc<DeploymentService>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApplicationView>), ApiError> {
    let Json(request) = payload.map_err(|e| DeployError::InvalidRequest(e.body_text()))?;
    let app = service.create_deployment(request).await?;
    Ok((StatusCode::CREATED, Json(app.into())))
}

async fn list_deployments(
    State(service): State<Arc<DeploymentService>>,
) -> Json<Vec<ApplicationView>> {
    Json(
        service
            .list_deployments()
            .await
            .into_iter()
            .map(ApplicationView::from)
            .collect(),
    )
}

async fn get_deployment(
    State(service): State<Arc<DeploymentService>>,
    Path(id): Path<String>,
) -> Result<Json<ApplicationView>, ApiError> {
    Ok(Json(service.get_deployment(&id).await?.into()))
}

async fn delete_deployment(
    State(service): State<Arc<DeploymentService>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    service.delete_deployment(&id).await?;
    Ok(Json(json!({
        "message": "Application deleted",
        "id": id,
    })))
}

async fn deployment_events(
    State(service): State<Arc<DeploymentService>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeploymentEvent>>, ApiError> {
    Ok(Json(service.deployment_events(&id).await?))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    100
}

async fn deployment_logs(
    State(service): State<Arc<DeploymentService>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = service.deployment_logs(&id, query.tail).await?;
    Ok(Json(json!({
        "id": id,
        "lines": lines,
    })))
}

async fn prune_images(
    State(service): State<Arc<DeploymentService>>,
) -> Result<impl IntoResponse, ApiError> {
    let report = service.prune_images().await?;
    Ok(Json(json!({
        "message": "Dangling images pruned",
        "images_deleted": report.images_deleted,
        "space_reclaimed": report.space_reclaimed,
    })))
}

async fn recover_containers(
    State(service): State<Arc<DeploymentService>>,
) -> Json<Reconciliation> {
    Json(service.reconcile_containers().await)
}

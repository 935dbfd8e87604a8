//! Deployment endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use hyde_id::{DeploymentId, InfrastructureId};
use tracing::{error, info};

use super::error::ApiError;
use crate::model::{Deployment, DeploymentRequest, Parameters};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/deployment", get(list_deployments).post(create_deployment))
        .route("/deployment/{deployment_id}", get(get_deployment))
        .route(
            "/deployment/{deployment_id}/{infra_id}",
            delete(delete_infrastructure),
        )
        .route(
            "/deployment/{deployment_id}/{infra_id}/{product}",
            put(provision_product),
        )
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /deployment
async fn create_deployment(
    State(state): State<AppState>,
    payload: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let Json(request) = payload?;
    info!(deployment = %request.name, "Create deployment requested");

    match state.controller().create_deployment(request).await {
        Ok(deployment) => Ok((StatusCode::CREATED, Json(deployment))),
        Err(e) => {
            error!(error = %e, "Failed to create deployment");
            Err(e.into())
        }
    }
}

/// GET /deployment
async fn list_deployments(
    State(state): State<AppState>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    Ok(Json(state.controller().list_deployments().await?))
}

/// GET /deployment/{deployment_id}
async fn get_deployment(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id = DeploymentId::parse(&deployment_id)?;
    Ok(Json(state.controller().get_deployment(&deployment_id).await?))
}

/// DELETE /deployment/{deployment_id}/{infra_id}
async fn delete_infrastructure(
    State(state): State<AppState>,
    Path((deployment_id, infra_id)): Path<(String, String)>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id = DeploymentId::parse(&deployment_id)?;
    let infra_id = InfrastructureId::parse(&infra_id)?;

    match state
        .controller()
        .delete_infrastructure(&deployment_id, &infra_id)
        .await
    {
        Ok(deployment) => Ok(Json(deployment)),
        Err(e) => {
            error!(deployment_id = %deployment_id, infra_id = %infra_id, error = %e, "Failed to delete infrastructure");
            Err(e.into())
        }
    }
}

/// PUT /deployment/{deployment_id}/{infra_id}/{product}
///
/// Query parameters become provisioner arguments.
async fn provision_product(
    State(state): State<AppState>,
    Path((deployment_id, infra_id, product)): Path<(String, String, String)>,
    Query(args): Query<BTreeMap<String, String>>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id = DeploymentId::parse(&deployment_id)?;
    let infra_id = InfrastructureId::parse(&infra_id)?;
    let args: Parameters = args.into_iter().collect();

    match state
        .controller()
        .provision(&deployment_id, &infra_id, &product, args)
        .await
    {
        Ok(deployment) => Ok(Json(deployment)),
        Err(e) => {
            error!(deployment_id = %deployment_id, product = %product, error = %e, "Failed to provision product");
            Err(e.into())
        }
    }
}

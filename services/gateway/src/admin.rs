//! Admin API for tenant management, mounted on the same listener as the
//! data plane and behind the same `X-API-Key` gate (§6). There is no PKCE or
//! authorization-code exchange here: the authorization-code handshake that
//! obtains a refresh token happens out of band, and this surface only
//! accepts the resulting refresh token and registers it.
//!
//! Endpoints:
//! - POST   /admin/tenants              — register a tenant
//! - GET    /admin/tenants/{id}         — fetch tenant metadata (no secrets)
//! - POST   /admin/tenants/{id}/status  — set tenant status
//! - POST   /admin/tenants/{id}/tier    — set tenant rate tier

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use store::{RateTier, TenantId, TenantStatus};
use tracing::info;

use crate::auth;
use crate::error::Error;
use crate::GatewayState;

pub fn build_admin_router(state: GatewayState) -> Router {
    Router::new()
        .route("/admin/tenants", post(register_tenant))
        .route("/admin/tenants/{id}", get(get_tenant))
        .route("/admin/tenants/{id}/status", post(set_status))
        .route("/admin/tenants/{id}/tier", post(set_tier))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RegisterTenantRequest {
    name: String,
    region: String,
    #[serde(default)]
    tier: Option<RateTier>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    scopes: Vec<String>,
    instance_url: String,
}

/// POST /admin/tenants — registers a tenant from an already-obtained refresh
/// token. Never returns the credentials it was given.
async fn register_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<RegisterTenantRequest>,
) -> Result<impl IntoResponse, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;

    let tenant = state
        .registry
        .register(tenant::RegisterRequest {
            name: body.name,
            region: body.region,
            tier: body.tier.unwrap_or(RateTier::Basic),
            metadata: body.metadata,
            client_id: body.client_id,
            client_secret: body.client_secret,
            refresh_token: body.refresh_token,
            scopes: body.scopes,
            instance_url: body.instance_url,
        })
        .await?;

    info!(tenant_id = %tenant.id, name = tenant.name.as_str(), "tenant registered");
    Ok((StatusCode::CREATED, Json(tenant_view(&tenant))))
}

/// GET /admin/tenants/{id} — tenant metadata only; OAuth credentials are
/// never returned once stored.
async fn get_tenant(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<TenantId>,
) -> Result<Json<serde_json::Value>, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;
    let with_config = state.registry.get_tenant(id).await?;
    Ok(Json(tenant_view(&with_config.tenant)))
}

#[derive(Debug, Deserialize)]
struct SetStatusRequest {
    status: TenantStatus,
}

async fn set_status(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<TenantId>,
    Json(body): Json<SetStatusRequest>,
) -> Result<StatusCode, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;
    state.registry.update_status(id, body.status).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SetTierRequest {
    tier: RateTier,
}

async fn set_tier(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<TenantId>,
    Json(body): Json<SetTierRequest>,
) -> Result<StatusCode, Error> {
    auth::check_api_key(&headers, &state.auth_config)?;
    state.registry.update_tier(id, body.tier).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn tenant_view(tenant: &store::Tenant) -> serde_json::Value {
    serde_json::json!({
        "id": tenant.id,
        "name": tenant.name,
        "region": tenant.region,
        "status": tenant.status,
        "tier": tenant.tier,
        "createdAt": tenant.created_at,
        "updatedAt": tenant.updated_at,
    })
}

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::access::{AccessControl, AccessRequest, CleanupReport, FeatureStatus};
use crate::blacklist::{BlacklistEntry, BlacklistIpParams, BlacklistQuery, SecurityAnalytics};
use crate::error::Error;
use crate::identity::extract_identity;
use crate::rate_limit::RateLimitAnalytics;
use crate::reflink::{AiFeature, BudgetStatus, CreateReflinkInput, Reflink, UpdateReflinkInput};
use crate::store::UsageReceipt;

/// Guard for AI routes: runs every access gate before the handler and
/// attaches rate-limit headers to whatever comes back.
///
/// The gated feature defaults to chat; to guard a premium feature, layer
/// [`require_feature`] outside this middleware so the tag is set before the
/// gates run. On success the
/// [`crate::access::AccessGrant`] is stored as a request extension so the
/// handler can record usage against it.
pub async fn access_control_middleware(
    State(access): State<Arc<AccessControl>>,
    mut request: Request,
    next: Next,
) -> Response {
    let feature = request
        .extensions()
        .get::<AiFeature>()
        .copied()
        .unwrap_or(AiFeature::Chat);
    let identity = extract_identity(request.headers(), request.uri().query());

    match access
        .check_access(&AccessRequest { identity, feature })
        .await
    {
        Ok(grant) => {
            let headers = grant.rate_limit.to_header_map();
            request.extensions_mut().insert(grant);
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers);
            response
        }
        Err(e) => e.into_response(),
    }
}

/// Tag requests with the feature a route belongs to, for
/// [`access_control_middleware`] to pick up.
pub async fn require_feature(feature: AiFeature, mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(feature);
    next.run(request).await
}

/// Public (unauthenticated) routes: advisory feature status for UI gating.
pub fn public_router(access: Arc<AccessControl>) -> Router {
    Router::new()
        .route("/ai/status/{feature}", get(feature_status_handler))
        .with_state(access)
}

/// Administrative surface. Authentication is expected to be layered on by
/// the embedding application; nothing here is safe to expose raw.
pub fn admin_router(access: Arc<AccessControl>) -> Router {
    Router::new()
        .route("/reflinks", post(create_reflink_handler).get(list_reflinks_handler))
        .route(
            "/reflinks/{id}",
            get(get_reflink_handler)
                .patch(update_reflink_handler)
                .delete(delete_reflink_handler),
        )
        .route("/reflinks/{id}/reset", post(reset_reflink_handler))
        .route("/reflinks/{id}/budget", get(reflink_budget_handler))
        .route("/reflinks/{id}/usage", post(record_usage_handler))
        .route("/blacklist", get(list_blacklist_handler).post(blacklist_ip_handler))
        .route(
            "/blacklist/{ip}",
            get(get_blacklist_handler).delete(remove_blacklist_handler),
        )
        .route("/blacklist/{ip}/reinstate", post(reinstate_handler))
        .route("/analytics/rate-limits", get(rate_limit_analytics_handler))
        .route("/analytics/security", get(security_analytics_handler))
        .route("/cache/status", get(cache_status_handler))
        .route("/config", get(config_handler))
        .route("/cleanup", post(cleanup_handler))
        .with_state(access)
}

fn admin_user(headers: &HeaderMap) -> String {
    headers
        .get("x-admin-user")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("admin")
        .to_string()
}

async fn feature_status_handler(
    State(access): State<Arc<AccessControl>>,
    Path(feature): Path<AiFeature>,
    request: Request,
) -> Result<Json<FeatureStatus>, Error> {
    let identity = extract_identity(request.headers(), request.uri().query());
    let status = access.feature_status(&identity, feature).await?;
    Ok(Json(status))
}

async fn create_reflink_handler(
    State(access): State<Arc<AccessControl>>,
    headers: HeaderMap,
    Json(input): Json<CreateReflinkInput>,
) -> Result<(StatusCode, Json<Reflink>), Error> {
    let reflink = access
        .reflinks()
        .create(input, &admin_user(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(reflink)))
}

async fn list_reflinks_handler(
    State(access): State<Arc<AccessControl>>,
) -> Result<Json<Vec<Reflink>>, Error> {
    Ok(Json(access.reflinks().list().await?))
}

async fn get_reflink_handler(
    State(access): State<Arc<AccessControl>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reflink>, Error> {
    Ok(Json(access.reflinks().get(id).await?))
}

async fn update_reflink_handler(
    State(access): State<Arc<AccessControl>>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateReflinkInput>,
) -> Result<Json<Reflink>, Error> {
    Ok(Json(access.reflinks().update(id, input).await?))
}

async fn delete_reflink_handler(
    State(access): State<Arc<AccessControl>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    access.reflinks().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_reflink_handler(
    State(access): State<Arc<AccessControl>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reflink>, Error> {
    Ok(Json(access.reflinks().reset_usage(id).await?))
}

async fn reflink_budget_handler(
    State(access): State<Arc<AccessControl>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BudgetStatus>, Error> {
    Ok(Json(access.reflinks().budget_status(id).await?))
}

#[derive(Debug, Deserialize)]
struct RecordUsageBody {
    tokens: u64,
    spend: f64,
}

async fn record_usage_handler(
    State(access): State<Arc<AccessControl>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RecordUsageBody>,
) -> Result<Json<UsageReceipt>, Error> {
    let receipt = access
        .reflinks()
        .record_usage(id, body.tokens, body.spend)
        .await?;
    Ok(Json(receipt))
}

async fn list_blacklist_handler(
    State(access): State<Arc<AccessControl>>,
    Query(query): Query<BlacklistQuery>,
) -> Result<Json<Vec<BlacklistEntry>>, Error> {
    Ok(Json(access.blacklist().list(&query).await?))
}

async fn blacklist_ip_handler(
    State(access): State<Arc<AccessControl>>,
    headers: HeaderMap,
    Json(mut params): Json<BlacklistIpParams>,
) -> Result<(StatusCode, Json<BlacklistEntry>), Error> {
    if params.blocked_by.is_none() {
        params.blocked_by = Some(admin_user(&headers));
    }
    let entry = access.blacklist().blacklist_ip(params).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_blacklist_handler(
    State(access): State<Arc<AccessControl>>,
    Path(ip): Path<IpAddr>,
) -> Result<Response, Error> {
    match access.blacklist().get(ip).await? {
        Some(entry) => Ok(Json(entry).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

async fn remove_blacklist_handler(
    State(access): State<Arc<AccessControl>>,
    Path(ip): Path<IpAddr>,
) -> Result<StatusCode, Error> {
    access.blacklist().remove(ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct ReinstateBody {
    reason: Option<String>,
}

async fn reinstate_handler(
    State(access): State<Arc<AccessControl>>,
    Path(ip): Path<IpAddr>,
    headers: HeaderMap,
    body: Option<Json<ReinstateBody>>,
) -> Result<Json<BlacklistEntry>, Error> {
    let reason = body.as_ref().and_then(|b| b.reason.clone());
    let entry = access
        .blacklist()
        .reinstate(ip, &admin_user(&headers), reason.as_deref())
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct AnalyticsWindow {
    #[serde(default = "default_window_days")]
    window_days: u32,
}

fn default_window_days() -> u32 {
    30
}

async fn rate_limit_analytics_handler(
    State(access): State<Arc<AccessControl>>,
    Query(window): Query<AnalyticsWindow>,
) -> Result<Json<RateLimitAnalytics>, Error> {
    Ok(Json(access.rate_limiter().analytics(window.window_days).await?))
}

async fn security_analytics_handler(
    State(access): State<Arc<AccessControl>>,
    Query(window): Query<AnalyticsWindow>,
) -> Result<Json<SecurityAnalytics>, Error> {
    Ok(Json(access.blacklist().analytics(window.window_days).await?))
}

async fn cache_status_handler(
    State(access): State<Arc<AccessControl>>,
) -> Json<serde_json::Value> {
    let stats = access.status_cache_stats();
    let entries: Vec<serde_json::Value> = access
        .status_cache_entries()
        .into_iter()
        .map(|(key, status)| json!({ "key": key, "status": status }))
        .collect();
    Json(json!({ "stats": stats, "entries": entries }))
}

async fn config_handler(
    State(access): State<Arc<AccessControl>>,
) -> Json<crate::config::AccessConfig> {
    Json(access.config().as_ref().clone())
}

async fn cleanup_handler(
    State(access): State<Arc<AccessControl>>,
) -> Result<Json<CleanupReport>, Error> {
    Ok(Json(access.cleanup().await?))
}

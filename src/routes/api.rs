use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::error::{AppError, AppResult, DataEnvelope};
use crate::session_issuer::SessionIssuer;
use crate::store::models::{AdQueryRequest, PushSubscription};
use crate::AppState;

/// The one public, unauthenticated endpoint (core spec §9 identifier
/// widening). Kept apart from [`router`] so the caller can wrap only this
/// route in a per-IP rate limiter without touching the rest of the surface.
pub fn create_session_router() -> Router<Arc<AppState>> {
    Router::new().route("/create_session", get(create_session))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session_exists", get(session_exists))
        .route("/update_push_sub", get(update_push_sub))
        .route("/get_ad_queries", get(get_ad_queries))
        .route("/get_ad_query", get(get_ad_query))
        .route("/get_ad_query_status", get(get_ad_query_status))
        .route("/insert_ad_query", get(insert_ad_query))
        .route("/update_ad_query", get(update_ad_query))
        .route("/delete_ad_query", get(delete_ad_query))
        .route("/list_ad_content", get(list_ad_content))
        .route(
            "/toggle_ad_query_subscription",
            get(toggle_ad_query_subscription),
        )
}

#[derive(Deserialize)]
struct SessionIdQuery {
    session_id: String,
}

#[derive(Deserialize)]
struct OptionalSessionQuery {
    session_id: Option<String>,
    ad_query_id: Option<i64>,
}

#[derive(Deserialize)]
struct SessionAndAdQueryQuery {
    session_id: String,
    ad_query_id: i64,
}

#[derive(Deserialize)]
struct AdQueryIdQuery {
    ad_query_id: i64,
}

#[derive(Deserialize)]
struct UpdatePushSubQuery {
    session_id: String,
    push_sub: String,
}

#[derive(Deserialize)]
struct AdQueryFieldsQuery {
    session_id: String,
    nickname: String,
    query: String,
    filters: String,
    subscribed: bool,
}

#[derive(Deserialize)]
struct UpdateAdQueryFieldsQuery {
    session_id: String,
    ad_query_id: i64,
    nickname: String,
    query: String,
    filters: String,
    subscribed: bool,
}

#[derive(Deserialize)]
struct ToggleSubQuery {
    session_id: String,
    ad_query_id: i64,
    subscribed: bool,
}

fn parse_filters(raw: &str) -> AppResult<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|_| AppError::DataArgument("filters must decode to an array of strings".into()))
}

/// `nickname` must be non-empty (core spec §3 data model).
fn validate_nickname(nickname: &str) -> AppResult<()> {
    if nickname.trim().is_empty() {
        return Err(AppError::DataArgument("nickname must not be empty".into()));
    }
    Ok(())
}

/// Normalizes the `push_sub` wire form (core spec §9): the literal JSON
/// `"null"` means "unsubscribe", an empty string means "no change
/// requested" and is rejected, anything else must decode to a valid
/// subscription object.
fn parse_push_sub(raw: &str) -> AppResult<Option<String>> {
    if raw.is_empty() {
        return Err(AppError::DataArgument(
            "push_sub must not be empty".into(),
        ));
    }
    if raw == "null" {
        return Ok(None);
    }

    let sub: PushSubscription = serde_json::from_str(raw)
        .map_err(|_| AppError::DataArgument("push_sub is not a valid subscription".into()))?;
    Ok(Some(
        serde_json::to_string(&sub).map_err(|e| AppError::Internal(e.into()))?,
    ))
}

async fn create_session(State(state): State<Arc<AppState>>) -> AppResult<DataEnvelope<serde_json::Value>> {
    let issuer = SessionIssuer::new(&state.store, state.config.intervals.session_expiration_secs);
    let issued = issuer.issue().await?;
    Ok(DataEnvelope::new(serde_json::json!({
        "sessionId": issued.session_id,
        "vapidPub": issued.vapid_pub_b64,
    })))
}

async fn session_exists(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionIdQuery>,
) -> AppResult<DataEnvelope<bool>> {
    let exists = state.store.session_exists(&q.session_id).await?;
    Ok(DataEnvelope::new(exists))
}

async fn update_push_sub(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UpdatePushSubQuery>,
) -> AppResult<DataEnvelope<()>> {
    let push_sub = parse_push_sub(&q.push_sub)?;
    let found = state
        .store
        .update_client_push_sub(&q.session_id, push_sub)
        .await?;
    if !found {
        return Err(AppError::NotFound("unknown session".into()));
    }
    Ok(DataEnvelope::new(()))
}

async fn get_ad_queries(
    State(state): State<Arc<AppState>>,
    Query(q): Query<OptionalSessionQuery>,
) -> AppResult<DataEnvelope<Vec<crate::store::models::AdQuery>>> {
    let rows = state
        .store
        .ad_queries(q.session_id.as_deref(), q.ad_query_id)
        .await?;
    Ok(DataEnvelope::new(rows))
}

async fn get_ad_query(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionAndAdQueryQuery>,
) -> AppResult<DataEnvelope<crate::store::models::AdQuery>> {
    let mut rows = state
        .store
        .ad_queries(Some(&q.session_id), Some(q.ad_query_id))
        .await?;
    let row = rows
        .pop()
        .ok_or_else(|| AppError::NotFound(format!("ad query {} not found", q.ad_query_id)))?;
    Ok(DataEnvelope::new(row))
}

async fn get_ad_query_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionAndAdQueryQuery>,
) -> AppResult<DataEnvelope<crate::store::models::AdQueryStatus>> {
    let status = state
        .store
        .ad_query_status(&q.session_id, q.ad_query_id)
        .await?;
    Ok(DataEnvelope::new(status))
}

async fn insert_ad_query(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AdQueryFieldsQuery>,
) -> AppResult<DataEnvelope<String>> {
    validate_nickname(&q.nickname)?;
    let filters = parse_filters(&q.filters)?;
    let req = AdQueryRequest {
        nickname: q.nickname,
        query: q.query,
        filters,
        subscribed: q.subscribed,
    };

    let sub_session_id = if req.subscribed {
        Some(q.session_id.as_str())
    } else {
        None
    };

    let id = state.store.insert_ad_query(&req, sub_session_id).await?;
    let id = id.ok_or_else(|| AppError::DataArgument("unknown session".into()))?;
    Ok(DataEnvelope::new(id.to_string()))
}

async fn update_ad_query(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UpdateAdQueryFieldsQuery>,
) -> AppResult<DataEnvelope<serde_json::Value>> {
    validate_nickname(&q.nickname)?;
    let filters = parse_filters(&q.filters)?;
    let req = AdQueryRequest {
        nickname: q.nickname,
        query: q.query,
        filters,
        subscribed: q.subscribed,
    };

    let (updated_data, updated_sub) = state
        .store
        .update_ad_query(q.ad_query_id, &req, &q.session_id)
        .await?;

    Ok(DataEnvelope::new(serde_json::json!({
        "updated_data": updated_data,
        "updated_sub": updated_sub,
    })))
}

async fn delete_ad_query(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AdQueryIdQuery>,
) -> AppResult<DataEnvelope<bool>> {
    let deleted = state.store.delete_ad_query(q.ad_query_id).await?;
    Ok(DataEnvelope::new(deleted))
}

async fn list_ad_content(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AdQueryIdQuery>,
) -> AppResult<DataEnvelope<Vec<crate::store::models::AdContentRow>>> {
    let rows = state.store.list_ad_content(q.ad_query_id).await?;
    Ok(DataEnvelope::new(rows))
}

async fn toggle_ad_query_subscription(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ToggleSubQuery>,
) -> AppResult<DataEnvelope<()>> {
    let toggled = state
        .store
        .toggle_ad_query_subscription(q.ad_query_id, &q.session_id, q.subscribed)
        .await?;
    if !toggled {
        return Err(AppError::DataArgument("unknown session or ad query".into()));
    }
    Ok(DataEnvelope::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::AdQueryRow;

    #[test]
    fn parse_filters_rejects_non_array_json() {
        assert!(parse_filters("{}").is_err());
        assert!(parse_filters("not json").is_err());
    }

    #[test]
    fn parse_filters_accepts_string_array() {
        assert_eq!(
            parse_filters(r#"["a","b"]"#).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn validate_nickname_rejects_empty_and_whitespace() {
        assert!(validate_nickname("").is_err());
        assert!(validate_nickname("   ").is_err());
        assert!(validate_nickname("sale-watch").is_ok());
    }

    #[test]
    fn parse_push_sub_rejects_empty_string() {
        assert!(matches!(parse_push_sub(""), Err(AppError::DataArgument(_))));
    }

    #[test]
    fn parse_push_sub_null_literal_means_unsubscribe() {
        assert_eq!(parse_push_sub("null").unwrap(), None);
    }

    #[test]
    fn parse_push_sub_rejects_malformed_subscription() {
        assert!(parse_push_sub(r#"{"not":"a subscription"}"#).is_err());
    }

    /// Testable property 9: an `AdQueryRow`'s wire form survives a round
    /// trip through its JSON representation and back through the
    /// query-param parsing used by `insert_ad_query`/`update_ad_query`,
    /// ignoring `subscribed`.
    #[test]
    fn ad_query_round_trips_through_its_wire_form() {
        let row = AdQueryRow {
            ad_query_id: 1,
            nickname: "sale-watch".into(),
            query: "discount sale".into(),
            filters: serde_json::to_string(&vec!["sale", "deal"]).unwrap(),
            next_pull: 0,
            last_pull: None,
            last_error: None,
            last_notify: None,
        };

        let wire = row.clone().into_api(true);
        let filters_json = serde_json::to_string(&wire.filters).unwrap();
        let req = AdQueryRequest {
            nickname: wire.nickname.clone(),
            query: wire.query.clone(),
            filters: parse_filters(&filters_json).unwrap(),
            subscribed: false,
        };

        assert_eq!(req.nickname, row.nickname);
        assert_eq!(req.query, row.query);
        assert_eq!(
            req.filters,
            serde_json::from_str::<Vec<String>>(&row.filters).unwrap()
        );
    }
}

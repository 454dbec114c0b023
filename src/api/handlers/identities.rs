use crate::{
    api::{handlers::auth_request, AppState},
    auth::Identity,
    session::Session,
};
use axum::{
    extract::{Extension, Query},
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Identities {
    brokers: Vec<String>,
    identities: Vec<Identity>,
}

#[utoipa::path(
    get,
    path= "/auth/identities",
    responses (
        (status = 200, description = "Registered brokers and the identities of this session", body = Identities)
    ),
    tag = "auth",
)]
/// List registered brokers and every identity the session carries.
pub async fn identities(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<Arc<Session>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let request = auth_request(&state, session, query, headers);
    Json(Identities {
        brokers: state
            .registry
            .broker_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        identities: state.registry.identify_all(&request).await,
    })
}

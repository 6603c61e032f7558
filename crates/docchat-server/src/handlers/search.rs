use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::services::CacheStats;
use crate::state::AppState;
use crate::store::{SearchHit, StoreStats};

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub owner: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub store: StoreStats,
    pub cache: CacheStats,
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Json<SearchResponse> {
    let hits = state
        .store
        .search_scoped(&params.q, params.owner.as_deref(), params.limit);

    Json(SearchResponse {
        query: params.q,
        total: hits.len(),
        hits,
    })
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub cleared: usize,
    pub cache: CacheStats,
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<ClearCacheResponse> {
    let cleared = state.cache().clear();
    Json(ClearCacheResponse {
        cleared,
        cache: state.cache().stats(),
    })
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        store: state.store.stats(),
        cache: state.cache().stats(),
    })
}

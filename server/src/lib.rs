//! HTTP delivery for a [`staticd_tree::TreeManager`] snapshot: path
//! resolution, conditional requests, byte ranges and transparent handling
//! of pre-compressed entries.

use std::sync::Arc;

use axum::Router;
use staticd_tree::TreeManager;

pub mod content;
pub mod mime;
pub mod ranges;
mod serve;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TreeManager>,

    /// Compressed aliases up to this many bytes are decompressed fully in
    /// memory for clients without gzip support, keeping them seekable.
    pub decode_budget: u64,
}

impl AppState {
    pub fn new(manager: Arc<TreeManager>, decode_budget: u64) -> Self {
        Self {
            manager,
            decode_budget,
        }
    }
}

/// Constructs the router. Every path is a tree lookup, so the single
/// fallback handler serves the whole space (and answers other methods
/// with 405).
pub fn gen_router() -> Router<AppState> {
    Router::new().fallback(serve::serve)
}

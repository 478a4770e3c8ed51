//! Insight-driven valuation adjustment engine.
//!
//! Analysts record insights, attach scope rules and effect channels to them,
//! materialize the rules into per-symbol targets, and the evaluator folds the
//! interpolated channel values into a base valuation stage by stage.

pub mod base_valuation;
pub mod facts;
pub mod insights;
pub mod materialize;
pub mod metrics;
pub mod scope;
pub mod search;
pub mod service;
pub mod timeline;
pub mod universe;
pub mod valuation;

use common::{EngineError, EngineResult};
use serde::Serialize;

pub use service::{EngineSettings, InsightEngine};

/// Upper bound for any page size requested through list operations.
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn check_page(limit: usize) -> EngineResult<usize> {
    if limit == 0 {
        return Err(EngineError::validation("limit must be > 0"));
    }
    Ok(limit.min(MAX_PAGE_LIMIT))
}

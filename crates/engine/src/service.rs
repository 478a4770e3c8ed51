//! Async facade over the engine.
//!
//! Every operation runs as one closure on the `AsyncDb` worker thread, so
//! writes are serialized process-wide and each call reads a consistent view.
//! Domain errors travel inside `anyhow::Error` and can be recovered with
//! `downcast_ref::<EngineError>()`.

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use common::config::{Config, ConfidencePenalties};
use common::db::AsyncDb;
use common::types::MethodKey;
use common::EngineError;

use crate::base_valuation::BaseValuationProvider;
use crate::facts::{self, Fact};
use crate::insights::{self, Insight, InsightPatch, InsightQuery, NewInsight};
use crate::materialize::{self, MaterializationPreview, MaterializedTarget};
use crate::metrics;
use crate::scope::{self, ScopeRule, ScopeRuleSpec};
use crate::search::{self, SearchHit, SearchQuery};
use crate::timeline::{self, ChannelSpec, EffectChannel, EffectPoint};
use crate::universe::InstrumentUniverse;
use crate::valuation::{self, ValuationAdjustmentResult};
use crate::Page;

/// Tunables taken from the `materialization`, `valuation` and `search` config sections.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_preview_limit: usize,
    pub max_preview_limit: usize,
    pub confidence_penalties: ConfidencePenalties,
    pub max_batch_symbols: usize,
    pub search_default_limit: usize,
    pub search_max_limit: usize,
    pub snippet_tokens: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_preview_limit: 50,
            max_preview_limit: 1000,
            confidence_penalties: ConfidencePenalties::default(),
            max_batch_symbols: 500,
            search_default_limit: 20,
            search_max_limit: 100,
            snippet_tokens: 12,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_preview_limit: config.materialization.default_preview_limit,
            max_preview_limit: config.materialization.max_preview_limit,
            confidence_penalties: config.valuation.confidence_penalties,
            max_batch_symbols: config.valuation.max_batch_symbols,
            search_default_limit: config.search.default_limit,
            search_max_limit: config.search.max_limit,
            snippet_tokens: config.search.snippet_tokens,
        }
    }
}

#[derive(Clone)]
pub struct InsightEngine {
    db: AsyncDb,
    universe: Arc<dyn InstrumentUniverse>,
    valuations: Arc<dyn BaseValuationProvider>,
    settings: Arc<EngineSettings>,
}

impl InsightEngine {
    pub fn new(
        db: AsyncDb,
        universe: Arc<dyn InstrumentUniverse>,
        valuations: Arc<dyn BaseValuationProvider>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            universe,
            valuations,
            settings: Arc::new(settings),
        }
    }

    // --- insights ---

    pub async fn create_insight(&self, new: NewInsight) -> Result<Insight> {
        self.db
            .call_named("create_insight", move |conn| {
                Ok(insights::create_insight(conn, new)?)
            })
            .await
    }

    pub async fn get_insight(&self, id: i64) -> Result<Insight> {
        self.db
            .call_named("get_insight", move |conn| Ok(insights::get_insight(conn, id)?))
            .await
    }

    pub async fn update_insight(&self, id: i64, patch: InsightPatch) -> Result<Insight> {
        self.db
            .call_named("update_insight", move |conn| {
                Ok(insights::update_insight(conn, id, patch)?)
            })
            .await
    }

    pub async fn remove_insight(&self, id: i64) -> Result<Insight> {
        self.db
            .call_named("remove_insight", move |conn| {
                Ok(insights::remove_insight(conn, id)?)
            })
            .await
    }

    pub async fn list_insights(&self, query: InsightQuery) -> Result<Page<Insight>> {
        self.db
            .call_named("list_insights", move |conn| {
                Ok(insights::list_insights(conn, &query)?)
            })
            .await
    }

    // --- scope ---

    pub async fn upsert_scope_rule(&self, insight_id: i64, spec: ScopeRuleSpec) -> Result<ScopeRule> {
        self.db
            .call_named("upsert_scope_rule", move |conn| {
                Ok(scope::upsert_scope_rule(conn, insight_id, spec)?)
            })
            .await
    }

    pub async fn remove_scope_rule(&self, id: i64) -> Result<ScopeRule> {
        self.db
            .call_named("remove_scope_rule", move |conn| {
                Ok(scope::remove_scope_rule(conn, id)?)
            })
            .await
    }

    pub async fn list_scope_rules(&self, insight_id: i64) -> Result<Vec<ScopeRule>> {
        self.db
            .call_named("list_scope_rules", move |conn| {
                Ok(scope::list_scope_rules(conn, insight_id)?)
            })
            .await
    }

    // --- materialization ---

    /// `limit` falls back to the configured default and is capped by the configured max.
    pub async fn preview_materialized_targets(
        &self,
        insight_id: i64,
        limit: Option<usize>,
        persist: bool,
    ) -> Result<MaterializationPreview> {
        let limit = limit
            .unwrap_or(self.settings.default_preview_limit)
            .min(self.settings.max_preview_limit);
        let universe = Arc::clone(&self.universe);
        let preview = self
            .db
            .call_named("preview_materialized_targets", move |conn| {
                Ok(materialize::preview_materialized_targets(
                    conn,
                    universe.as_ref(),
                    insight_id,
                    limit,
                    persist,
                )?)
            })
            .await?;
        metrics::record_materialization(&preview);
        Ok(preview)
    }

    pub async fn exclude_target(
        &self,
        insight_id: i64,
        symbol: String,
        reason: Option<String>,
    ) -> Result<MaterializedTarget> {
        let target = self
            .db
            .call_named("exclude_target", move |conn| {
                Ok(materialize::exclude_target(conn, insight_id, &symbol, reason)?)
            })
            .await?;
        metrics::record_exclusion("set");
        Ok(target)
    }

    pub async fn clear_target_exclusion(
        &self,
        insight_id: i64,
        symbol: String,
    ) -> Result<Option<MaterializedTarget>> {
        let universe = Arc::clone(&self.universe);
        let remaining = self
            .db
            .call_named("clear_target_exclusion", move |conn| {
                Ok(materialize::clear_target_exclusion(
                    conn,
                    universe.as_ref(),
                    insight_id,
                    &symbol,
                )?)
            })
            .await?;
        metrics::record_exclusion("cleared");
        Ok(remaining)
    }

    pub async fn list_targets(
        &self,
        insight_id: i64,
        include_excluded: bool,
    ) -> Result<Vec<MaterializedTarget>> {
        self.db
            .call_named("list_targets", move |conn| {
                Ok(materialize::list_targets(conn, insight_id, include_excluded)?)
            })
            .await
    }

    // --- effects ---

    pub async fn upsert_effect_channel(
        &self,
        insight_id: i64,
        spec: ChannelSpec,
    ) -> Result<EffectChannel> {
        self.db
            .call_named("upsert_effect_channel", move |conn| {
                Ok(timeline::upsert_effect_channel(conn, insight_id, spec)?)
            })
            .await
    }

    pub async fn remove_effect_channel(&self, id: i64) -> Result<EffectChannel> {
        self.db
            .call_named("remove_effect_channel", move |conn| {
                Ok(timeline::remove_effect_channel(conn, id)?)
            })
            .await
    }

    pub async fn list_effect_channels(&self, insight_id: i64) -> Result<Vec<EffectChannel>> {
        self.db
            .call_named("list_effect_channels", move |conn| {
                Ok(timeline::list_effect_channels(conn, insight_id)?)
            })
            .await
    }

    pub async fn upsert_effect_point(
        &self,
        channel_id: i64,
        effect_date: NaiveDate,
        effect_value: f64,
    ) -> Result<EffectPoint> {
        self.db
            .call_named("upsert_effect_point", move |conn| {
                Ok(timeline::upsert_effect_point(
                    conn,
                    channel_id,
                    effect_date,
                    effect_value,
                )?)
            })
            .await
    }

    pub async fn remove_effect_point(&self, id: i64) -> Result<EffectPoint> {
        self.db
            .call_named("remove_effect_point", move |conn| {
                Ok(timeline::remove_effect_point(conn, id)?)
            })
            .await
    }

    pub async fn list_effect_points(&self, channel_id: i64) -> Result<Vec<EffectPoint>> {
        self.db
            .call_named("list_effect_points", move |conn| {
                Ok(timeline::list_effect_points(conn, channel_id)?)
            })
            .await
    }

    pub async fn interpolate(&self, channel_id: i64, as_of: NaiveDate) -> Result<Option<f64>> {
        self.db
            .call_named("interpolate", move |conn| {
                Ok(timeline::interpolate_channel(conn, channel_id, as_of)?)
            })
            .await
    }

    // --- evaluation ---

    pub async fn compute_valuation_adjustment(
        &self,
        symbol: String,
        as_of: NaiveDate,
        method_key: Option<MethodKey>,
    ) -> Result<ValuationAdjustmentResult> {
        let valuations = Arc::clone(&self.valuations);
        let penalties = self.settings.confidence_penalties;
        let result = self
            .db
            .call_named("compute_valuation_adjustment", move |conn| {
                Ok(valuation::compute_valuation_adjustment(
                    conn,
                    valuations.as_ref(),
                    penalties,
                    &symbol,
                    as_of,
                    method_key.as_ref(),
                )?)
            })
            .await?;
        metrics::record_valuation(&result);
        Ok(result)
    }

    /// Evaluates every symbol inside one read transaction.
    pub async fn compute_valuation_adjustments(
        &self,
        symbols: Vec<String>,
        as_of: NaiveDate,
        method_key: Option<MethodKey>,
    ) -> Result<Vec<ValuationAdjustmentResult>> {
        if symbols.is_empty() {
            return Err(EngineError::validation("symbols must not be empty").into());
        }
        if symbols.len() > self.settings.max_batch_symbols {
            return Err(EngineError::validation(format!(
                "at most {} symbols per batch, got {}",
                self.settings.max_batch_symbols,
                symbols.len()
            ))
            .into());
        }
        let valuations = Arc::clone(&self.valuations);
        let penalties = self.settings.confidence_penalties;
        let results = self
            .db
            .call_named("compute_valuation_adjustments", move |conn| {
                let tx = conn.transaction()?;
                let results = valuation::compute_valuation_adjustments(
                    &tx,
                    valuations.as_ref(),
                    penalties,
                    &symbols,
                    as_of,
                    method_key.as_ref(),
                )?;
                tx.commit()?;
                Ok(results)
            })
            .await?;
        for result in &results {
            metrics::record_valuation(result);
        }
        Ok(results)
    }

    // --- search ---

    /// `limit` falls back to the configured default and is capped by the configured max.
    pub async fn search(
        &self,
        query: String,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Page<SearchHit>> {
        let q = SearchQuery {
            query,
            limit: limit
                .unwrap_or(self.settings.search_default_limit)
                .min(self.settings.search_max_limit),
            offset,
            snippet_tokens: self.settings.snippet_tokens,
        };
        let page = self
            .db
            .call_named("search", move |conn| Ok(search::search(conn, &q)?))
            .await?;
        metrics::record_search();
        Ok(page)
    }

    // --- facts ---

    pub async fn create_fact(&self, body: String) -> Result<Fact> {
        self.db
            .call_named("create_fact", move |conn| Ok(facts::create_fact(conn, &body)?))
            .await
    }

    pub async fn list_facts(&self, limit: usize, offset: usize) -> Result<Page<Fact>> {
        self.db
            .call_named("list_facts", move |conn| {
                Ok(facts::list_facts(conn, limit, offset)?)
            })
            .await
    }

    pub async fn remove_fact(&self, id: i64) -> Result<Fact> {
        self.db
            .call_named("remove_fact", move |conn| Ok(facts::remove_fact(conn, id)?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_valuation::StaticValuations;
    use crate::universe::StaticUniverse;

    async fn engine(settings: EngineSettings) -> InsightEngine {
        let db = AsyncDb::open(":memory:").await.unwrap();
        InsightEngine::new(
            db,
            Arc::new(StaticUniverse::new()),
            Arc::new(StaticValuations::new()),
            settings,
        )
    }

    fn engine_error(err: &anyhow::Error) -> &EngineError {
        err.downcast_ref::<EngineError>().unwrap()
    }

    #[tokio::test]
    async fn test_domain_errors_survive_the_worker() {
        let engine = engine(EngineSettings::default()).await;
        let err = engine.get_insight(42).await.unwrap_err();
        assert!(engine_error(&err).is_not_found());

        let err = engine
            .create_insight(NewInsight::default())
            .await
            .unwrap_err();
        assert!(engine_error(&err).is_validation());
    }

    #[tokio::test]
    async fn test_batch_size_is_bounded() {
        let engine = engine(EngineSettings {
            max_batch_symbols: 2,
            ..EngineSettings::default()
        })
        .await;
        let as_of = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let symbols = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let err = engine
            .compute_valuation_adjustments(symbols, as_of, None)
            .await
            .unwrap_err();
        assert!(engine_error(&err).is_validation());

        let err = engine
            .compute_valuation_adjustments(Vec::new(), as_of, None)
            .await
            .unwrap_err();
        assert!(engine_error(&err).is_validation());
    }

    #[tokio::test]
    async fn test_preview_limit_is_capped() {
        let engine = engine(EngineSettings {
            default_preview_limit: 1,
            max_preview_limit: 2,
            ..EngineSettings::default()
        })
        .await;
        let insight = engine
            .create_insight(NewInsight {
                title: "Broad".to_string(),
                ..NewInsight::default()
            })
            .await
            .unwrap();
        for symbol in ["AAA", "BBB", "CCC"] {
            engine
                .upsert_scope_rule(
                    insight.id,
                    ScopeRuleSpec {
                        scope_type: common::types::ScopeType::Symbol,
                        scope_key: symbol.to_string(),
                        mode: common::types::ScopeMode::Include,
                        enabled: true,
                    },
                )
                .await
                .unwrap();
        }

        let default = engine
            .preview_materialized_targets(insight.id, None, false)
            .await
            .unwrap();
        assert_eq!(default.symbols.len(), 1);
        let capped = engine
            .preview_materialized_targets(insight.id, Some(100), false)
            .await
            .unwrap();
        assert_eq!(capped.symbols.len(), 2);
        assert_eq!(capped.total, 3);
        assert!(capped.truncated);
    }
}

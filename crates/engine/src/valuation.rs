//! Valuation adjustment evaluator.
//!
//! Collects the channels of every active, in-window insight whose persisted
//! (non-excluded) targets contain the symbol, samples them on the as-of date
//! and folds them into the base value stage by stage. Read-only.

use chrono::NaiveDate;
use common::config::ConfidencePenalties;
use common::types::{format_date, normalize_symbol, EffectOperator, MethodKey, MetricKey, Stage};
use common::EngineResult;
use rusqlite::Connection;
use serde::Serialize;

use crate::base_valuation::BaseValuationProvider;
use crate::timeline::{load_points, sample, ChannelRow, ChannelSample, EffectChannel};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedEffect {
    pub insight_id: i64,
    pub insight_title: String,
    pub channel_id: i64,
    pub metric_key: MetricKey,
    pub stage: Stage,
    pub operator: EffectOperator,
    pub value: f64,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValuationAdjustmentResult {
    pub symbol: String,
    pub as_of_date: NaiveDate,
    pub method_key: Option<MethodKey>,
    pub not_applicable: bool,
    pub reason: Option<String>,
    pub base_value: Option<f64>,
    pub adjusted_value: Option<f64>,
    pub confidence: Option<f64>,
    pub degradation_reasons: Vec<String>,
    pub applied_effects: Vec<AppliedEffect>,
}

impl ValuationAdjustmentResult {
    fn not_applicable(symbol: String, as_of: NaiveDate, method_key: Option<MethodKey>) -> Self {
        let reason = format!(
            "no base valuation for {symbol} on or before {}{}",
            format_date(as_of),
            method_key
                .as_ref()
                .map(|m| format!(" using method {m}"))
                .unwrap_or_default()
        );
        Self {
            symbol,
            as_of_date: as_of,
            method_key,
            not_applicable: true,
            reason: Some(reason),
            base_value: None,
            adjusted_value: None,
            confidence: None,
            degradation_reasons: Vec::new(),
            applied_effects: Vec::new(),
        }
    }
}

/// Fold `effects` into `base` in (stage, priority, channel id) order.
/// Returns the final value and the effects in application order.
pub fn compose(base: f64, mut effects: Vec<AppliedEffect>) -> (f64, Vec<AppliedEffect>) {
    effects.sort_by_key(|e| (e.stage, e.priority, e.channel_id));
    let value = effects
        .iter()
        .fold(base, |current, e| e.operator.apply(current, e.value));
    (value, effects)
}

struct Candidate {
    insight_title: String,
    channel: EffectChannel,
}

/// Channels that may apply to `symbol` on `as_of` under `method_key`.
fn candidate_channels(
    conn: &Connection,
    symbol: &str,
    as_of: NaiveDate,
    method_key: &MethodKey,
) -> EngineResult<Vec<Candidate>> {
    let mut stmt = conn.prepare_cached(
        "SELECT i.title,
                c.id, c.insight_id, c.method_key, c.metric_key, c.stage, c.operator,
                c.priority, c.created_at, c.updated_at
         FROM effect_channels c
         JOIN insights i ON i.id = c.insight_id
         JOIN insight_targets t ON t.insight_id = i.id AND t.symbol = ?1 AND t.excluded = 0
         WHERE i.status = 'active'
           AND (i.valid_from IS NULL OR i.valid_from <= ?2)
           AND (i.valid_to IS NULL OR i.valid_to >= ?2)
           AND (c.method_key = ?3 OR c.method_key = ?4)
         ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                symbol,
                format_date(as_of),
                method_key.as_str(),
                MethodKey::WILDCARD
            ],
            |row| Ok((row.get::<_, String>(0)?, ChannelRow::from_row_at(row, 1)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(insight_title, row)| -> EngineResult<Candidate> {
            Ok(Candidate {
                insight_title,
                channel: row.into_channel()?,
            })
        })
        .collect()
}

fn clamp_confidence(c: f64) -> f64 {
    c.clamp(0.0, 1.0)
}

/// Adjusted valuation for one symbol on one date.
pub fn compute_valuation_adjustment(
    conn: &Connection,
    valuations: &dyn BaseValuationProvider,
    penalties: ConfidencePenalties,
    symbol: &str,
    as_of: NaiveDate,
    method_key: Option<&MethodKey>,
) -> EngineResult<ValuationAdjustmentResult> {
    let symbol = normalize_symbol(symbol)?;
    let Some(base) = valuations.base_valuation(conn, &symbol, as_of, method_key)? else {
        tracing::debug!(symbol = %symbol, as_of = %as_of, "no base valuation");
        return Ok(ValuationAdjustmentResult::not_applicable(
            symbol,
            as_of,
            method_key.cloned(),
        ));
    };

    let mut confidence = 1.0_f64;
    let mut degradation_reasons = Vec::new();
    if !base.missing_inputs.is_empty() {
        confidence *= penalties.missing_base_inputs;
        degradation_reasons.push(format!(
            "base valuation is missing inputs: {}",
            base.missing_inputs.join(", ")
        ));
    }

    let mut effects = Vec::new();
    for Candidate {
        insight_title,
        channel,
    } in candidate_channels(conn, &symbol, as_of, &base.method_key)?
    {
        let points = load_points(conn, channel.id)?;
        match sample(&points, as_of) {
            ChannelSample::Value(value) => effects.push(AppliedEffect {
                insight_id: channel.insight_id,
                insight_title,
                channel_id: channel.id,
                metric_key: channel.metric_key,
                stage: channel.stage,
                operator: channel.operator,
                value,
                priority: channel.priority,
            }),
            ChannelSample::OutOfRange { first, last } => {
                confidence *= penalties.channel_out_of_range;
                degradation_reasons.push(format!(
                    "channel {} of insight {} ({insight_title}) has no effect on {}: points cover {}..{}",
                    channel.id,
                    channel.insight_id,
                    format_date(as_of),
                    format_date(first),
                    format_date(last),
                ));
            }
            ChannelSample::NoPoints => {
                tracing::debug!(channel_id = channel.id, "channel has no points; skipped");
            }
        }
    }

    let (adjusted, applied_effects) = compose(base.value, effects);
    tracing::debug!(
        symbol = %symbol,
        as_of = %as_of,
        method_key = %base.method_key,
        base = base.value,
        adjusted,
        effects = applied_effects.len(),
        "valuation adjusted"
    );

    Ok(ValuationAdjustmentResult {
        symbol,
        as_of_date: as_of,
        method_key: Some(base.method_key),
        not_applicable: false,
        reason: None,
        base_value: Some(base.value),
        adjusted_value: Some(adjusted),
        confidence: Some(clamp_confidence(confidence)),
        degradation_reasons,
        applied_effects,
    })
}

/// Evaluate each symbol independently. The caller decides the snapshot by
/// passing one connection (or transaction) for the whole batch.
pub fn compute_valuation_adjustments(
    conn: &Connection,
    valuations: &dyn BaseValuationProvider,
    penalties: ConfidencePenalties,
    symbols: &[String],
    as_of: NaiveDate,
    method_key: Option<&MethodKey>,
) -> EngineResult<Vec<ValuationAdjustmentResult>> {
    symbols
        .iter()
        .map(|symbol| {
            compute_valuation_adjustment(conn, valuations, penalties, symbol, as_of, method_key)
        })
        .collect()
}

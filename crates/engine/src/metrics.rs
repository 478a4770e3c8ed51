use ::metrics::{describe_counter, describe_histogram};

use crate::materialize::MaterializationPreview;
use crate::valuation::ValuationAdjustmentResult;

pub const VALUATIONS_TOTAL: &str = "insights_valuations_total";
pub const EFFECTS_APPLIED_TOTAL: &str = "insights_effects_applied_total";
pub const VALUATION_CONFIDENCE: &str = "insights_valuation_confidence";
pub const TARGETS_MATERIALIZED_TOTAL: &str = "insights_targets_materialized_total";
pub const TARGET_EXCLUSIONS_TOTAL: &str = "insights_target_exclusions_total";
pub const SEARCHES_TOTAL: &str = "insights_searches_total";

pub fn describe() {
    describe_counter!(
        VALUATIONS_TOTAL,
        "Valuation adjustments computed, labelled by outcome."
    );
    describe_counter!(
        EFFECTS_APPLIED_TOTAL,
        "Effect channels folded into adjusted valuations."
    );
    describe_histogram!(
        VALUATION_CONFIDENCE,
        "Confidence of applicable valuation adjustments (0..1)."
    );
    describe_counter!(
        TARGETS_MATERIALIZED_TOTAL,
        "Targets written by persisted materializations."
    );
    describe_counter!(
        TARGET_EXCLUSIONS_TOTAL,
        "Exclusion overrides set or cleared, labelled by action."
    );
    describe_counter!(SEARCHES_TOTAL, "Full-text insight searches served.");
    describe_histogram!(
        "insights_db_query_latency_ms",
        "Database call latency in milliseconds, labelled by op and status."
    );
    describe_counter!(
        "insights_db_query_errors_total",
        "Database calls that returned an error, labelled by op."
    );
    describe_counter!(
        "insights_tracing_error_events",
        "ERROR-level tracing events emitted."
    );
}

pub(crate) fn record_valuation(result: &ValuationAdjustmentResult) {
    let outcome = if result.not_applicable {
        "not_applicable"
    } else {
        "adjusted"
    };
    ::metrics::counter!(VALUATIONS_TOTAL, "outcome" => outcome).increment(1);
    ::metrics::counter!(EFFECTS_APPLIED_TOTAL).increment(result.applied_effects.len() as u64);
    if let Some(confidence) = result.confidence {
        ::metrics::histogram!(VALUATION_CONFIDENCE).record(confidence);
    }
}

pub(crate) fn record_materialization(preview: &MaterializationPreview) {
    if preview.persisted {
        ::metrics::counter!(TARGETS_MATERIALIZED_TOTAL).increment(preview.total as u64);
    }
}

pub(crate) fn record_exclusion(action: &'static str) {
    ::metrics::counter!(TARGET_EXCLUSIONS_TOTAL, "action" => action).increment(1);
}

pub(crate) fn record_search() {
    ::metrics::counter!(SEARCHES_TOTAL).increment(1);
}

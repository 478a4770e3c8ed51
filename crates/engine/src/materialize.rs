//! Persisted scope membership and analyst exclusion overrides.

use std::collections::BTreeSet;

use common::types::normalize_symbol;
use common::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::insights::{get_insight, get_mutable_insight};
use crate::now_timestamp;
use crate::scope::resolve_scope;
use crate::universe::InstrumentUniverse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializedTarget {
    pub insight_id: i64,
    pub symbol: String,
    pub materialized_at: String,
    pub excluded: bool,
    pub exclude_reason: Option<String>,
    pub excluded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializationPreview {
    pub insight_id: i64,
    /// First `limit` effective symbols, sorted.
    pub symbols: Vec<String>,
    /// Effective target count before truncation.
    pub total: usize,
    pub truncated: bool,
    pub rule_count: usize,
    /// In-scope symbols suppressed by an exclusion override.
    pub excluded_count: usize,
    pub persisted: bool,
    /// Time of this persist, or of the last one when only previewing.
    pub materialized_at: Option<String>,
}

const SELECT_COLUMNS: &str =
    "insight_id, symbol, materialized_at, excluded, exclude_reason, excluded_at";

fn target_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MaterializedTarget> {
    Ok(MaterializedTarget {
        insight_id: row.get(0)?,
        symbol: row.get(1)?,
        materialized_at: row.get(2)?,
        excluded: row.get::<_, i64>(3)? != 0,
        exclude_reason: row.get(4)?,
        excluded_at: row.get(5)?,
    })
}

fn find_target(
    conn: &Connection,
    insight_id: i64,
    symbol: &str,
) -> EngineResult<Option<MaterializedTarget>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM insight_targets WHERE insight_id = ?1 AND symbol = ?2"
            ),
            rusqlite::params![insight_id, symbol],
            target_from_row,
        )
        .optional()?)
}

fn symbols_where(conn: &Connection, insight_id: i64, excluded: bool) -> EngineResult<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT symbol FROM insight_targets WHERE insight_id = ?1 AND excluded = ?2",
    )?;
    let symbols = stmt
        .query_map(rusqlite::params![insight_id, excluded], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(symbols)
}

/// Resolve scope, drop overridden symbols and report the result. With
/// `persist` the full effective set replaces the stored non-excluded rows in
/// one transaction; override rows are never touched.
pub fn preview_materialized_targets(
    conn: &mut Connection,
    universe: &dyn InstrumentUniverse,
    insight_id: i64,
    limit: usize,
    persist: bool,
) -> EngineResult<MaterializationPreview> {
    if limit == 0 {
        return Err(EngineError::validation("limit must be > 0"));
    }
    let tx = conn.transaction()?;
    get_mutable_insight(&tx, insight_id)?;

    let resolved = resolve_scope(&tx, universe, insight_id)?;
    let overrides = symbols_where(&tx, insight_id, true)?;
    let excluded_count = resolved.symbols.intersection(&overrides).count();
    let effective: BTreeSet<String> = resolved.symbols.difference(&overrides).cloned().collect();

    let materialized_at = if persist {
        let now = now_timestamp();
        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO insight_targets (insight_id, symbol, materialized_at, excluded)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(insight_id, symbol) DO UPDATE SET materialized_at = excluded.materialized_at",
            )?;
            for symbol in &effective {
                upsert.execute(rusqlite::params![insight_id, symbol, now])?;
            }

            let stale: Vec<String> = symbols_where(&tx, insight_id, false)?
                .difference(&effective)
                .cloned()
                .collect();
            let mut delete = tx.prepare_cached(
                "DELETE FROM insight_targets WHERE insight_id = ?1 AND symbol = ?2 AND excluded = 0",
            )?;
            for symbol in &stale {
                delete.execute(rusqlite::params![insight_id, symbol])?;
            }
            tracing::debug!(insight_id, removed = stale.len(), "stale targets removed");
        }
        tx.execute(
            "INSERT INTO insight_materializations (insight_id, rule_count, target_count, materialized_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(insight_id) DO UPDATE SET
                rule_count = excluded.rule_count,
                target_count = excluded.target_count,
                materialized_at = excluded.materialized_at",
            rusqlite::params![
                insight_id,
                resolved.rule_count as i64,
                effective.len() as i64,
                now
            ],
        )?;
        Some(now)
    } else {
        tx.query_row(
            "SELECT materialized_at FROM insight_materializations WHERE insight_id = ?1",
            [insight_id],
            |row| row.get(0),
        )
        .optional()?
    };
    tx.commit()?;

    if persist {
        tracing::info!(
            insight_id,
            targets = effective.len(),
            rules = resolved.rule_count,
            excluded = excluded_count,
            "targets materialized"
        );
    }

    let total = effective.len();
    Ok(MaterializationPreview {
        insight_id,
        symbols: effective.into_iter().take(limit).collect(),
        total,
        truncated: total > limit,
        rule_count: resolved.rule_count,
        excluded_count,
        persisted: persist,
        materialized_at,
    })
}

/// Mark `symbol` as excluded for the insight, creating the row if needed.
/// Repeating the call only refreshes the reason.
pub fn exclude_target(
    conn: &mut Connection,
    insight_id: i64,
    symbol: &str,
    reason: Option<String>,
) -> EngineResult<MaterializedTarget> {
    let symbol = normalize_symbol(symbol)?;
    let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
    let tx = conn.transaction()?;
    get_mutable_insight(&tx, insight_id)?;

    let now = now_timestamp();
    tx.execute(
        "INSERT INTO insight_targets (insight_id, symbol, materialized_at, excluded, exclude_reason, excluded_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?3)
         ON CONFLICT(insight_id, symbol) DO UPDATE SET
            excluded = 1,
            exclude_reason = excluded.exclude_reason,
            excluded_at = CASE WHEN insight_targets.excluded = 1
                               THEN insight_targets.excluded_at
                               ELSE excluded.excluded_at END",
        rusqlite::params![insight_id, symbol, now, reason],
    )?;
    let target = find_target(&tx, insight_id, &symbol)?
        .ok_or_else(|| EngineError::not_found("target", format!("{insight_id}/{symbol}")))?;
    tx.commit()?;

    tracing::info!(insight_id, symbol = %symbol, reason = ?target.exclude_reason, "target excluded");
    Ok(target)
}

/// Drop the override on `symbol`. Returns the surviving target when the symbol
/// is still in scope, `None` when the row was removed.
pub fn clear_target_exclusion(
    conn: &mut Connection,
    universe: &dyn InstrumentUniverse,
    insight_id: i64,
    symbol: &str,
) -> EngineResult<Option<MaterializedTarget>> {
    let symbol = normalize_symbol(symbol)?;
    let tx = conn.transaction()?;
    get_mutable_insight(&tx, insight_id)?;

    let has_override = find_target(&tx, insight_id, &symbol)?.is_some_and(|t| t.excluded);
    if !has_override {
        return Err(EngineError::not_found(
            "exclusion",
            format!("{insight_id}/{symbol}"),
        ));
    }

    let in_scope = resolve_scope(&tx, universe, insight_id)?.symbols.contains(&symbol);
    if in_scope {
        tx.execute(
            "UPDATE insight_targets
             SET excluded = 0, exclude_reason = NULL, excluded_at = NULL, materialized_at = ?3
             WHERE insight_id = ?1 AND symbol = ?2",
            rusqlite::params![insight_id, symbol, now_timestamp()],
        )?;
    } else {
        tx.execute(
            "DELETE FROM insight_targets WHERE insight_id = ?1 AND symbol = ?2",
            rusqlite::params![insight_id, symbol],
        )?;
    }
    let remaining = find_target(&tx, insight_id, &symbol)?;
    tx.commit()?;

    tracing::info!(insight_id, symbol = %symbol, in_scope, "target exclusion cleared");
    Ok(remaining)
}

/// Persisted rows sorted by symbol.
pub fn list_targets(
    conn: &Connection,
    insight_id: i64,
    include_excluded: bool,
) -> EngineResult<Vec<MaterializedTarget>> {
    get_insight(conn, insight_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM insight_targets
         WHERE insight_id = ?1 AND (?2 OR excluded = 0)
         ORDER BY symbol"
    ))?;
    let targets = stmt
        .query_map(rusqlite::params![insight_id, include_excluded], target_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{create_insight, NewInsight};
    use crate::scope::{remove_scope_rule, upsert_scope_rule, ScopeRuleSpec};
    use crate::test_support::db;
    use crate::universe::StaticUniverse;
    use common::types::{ScopeMode, ScopeType};

    fn insight(conn: &mut Connection) -> i64 {
        create_insight(
            conn,
            NewInsight {
                title: "Rate cuts".to_string(),
                ..NewInsight::default()
            },
        )
        .unwrap()
        .id
    }

    fn include(conn: &mut Connection, id: i64, symbol: &str) -> i64 {
        upsert_scope_rule(
            conn,
            id,
            ScopeRuleSpec {
                scope_type: ScopeType::Symbol,
                scope_key: symbol.to_string(),
                mode: ScopeMode::Include,
                enabled: true,
            },
        )
        .unwrap()
        .id
    }

    fn symbols(targets: &[MaterializedTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.symbol.as_str()).collect()
    }

    #[test]
    fn test_preview_does_not_write() {
        let mut db = db();
        let id = insight(&mut db.conn);
        for s in ["AAA", "BBB", "CCC"] {
            include(&mut db.conn, id, s);
        }
        let preview =
            preview_materialized_targets(&mut db.conn, &StaticUniverse::new(), id, 2, false).unwrap();
        assert_eq!(preview.symbols, vec!["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(preview.total, 3);
        assert!(preview.truncated);
        assert_eq!(preview.rule_count, 3);
        assert_eq!(preview.materialized_at, None);
        assert!(list_targets(&db.conn, id, true).unwrap().is_empty());
    }

    #[test]
    fn test_persist_is_idempotent_and_drops_stale_rows() {
        let mut db = db();
        let u = StaticUniverse::new();
        let id = insight(&mut db.conn);
        include(&mut db.conn, id, "AAA");
        let bbb = include(&mut db.conn, id, "BBB");

        let first = preview_materialized_targets(&mut db.conn, &u, id, 10, true).unwrap();
        assert!(first.materialized_at.is_some());
        let again = preview_materialized_targets(&mut db.conn, &u, id, 10, true).unwrap();
        assert_eq!(first.symbols, again.symbols);
        assert_eq!(symbols(&list_targets(&db.conn, id, true).unwrap()), vec!["AAA", "BBB"]);

        remove_scope_rule(&mut db.conn, bbb).unwrap();
        preview_materialized_targets(&mut db.conn, &u, id, 10, true).unwrap();
        assert_eq!(symbols(&list_targets(&db.conn, id, true).unwrap()), vec!["AAA"]);

        let preview = preview_materialized_targets(&mut db.conn, &u, id, 10, false).unwrap();
        assert!(preview.materialized_at.is_some());
    }

    #[test]
    fn test_exclusion_survives_rematerialization() {
        let mut db = db();
        let u = StaticUniverse::new();
        let id = insight(&mut db.conn);
        include(&mut db.conn, id, "AAA");
        include(&mut db.conn, id, "BBB");
        preview_materialized_targets(&mut db.conn, &u, id, 10, true).unwrap();

        let excluded = exclude_target(&mut db.conn, id, "aaa", Some("hedged elsewhere".to_string())).unwrap();
        assert!(excluded.excluded);
        let again = exclude_target(&mut db.conn, id, "AAA", None).unwrap();
        assert_eq!(again.excluded_at, excluded.excluded_at);

        let preview = preview_materialized_targets(&mut db.conn, &u, id, 10, true).unwrap();
        assert_eq!(preview.symbols, vec!["BBB".to_string()]);
        assert_eq!(preview.excluded_count, 1);

        let all = list_targets(&db.conn, id, true).unwrap();
        assert_eq!(symbols(&all), vec!["AAA", "BBB"]);
        assert!(all[0].excluded);
        assert_eq!(symbols(&list_targets(&db.conn, id, false).unwrap()), vec!["BBB"]);
    }

    #[test]
    fn test_exclude_creates_row_for_unmaterialized_symbol() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let target = exclude_target(&mut db.conn, id, "ZZZ", None).unwrap();
        assert!(target.excluded);
        assert_eq!(target.exclude_reason, None);
        assert!(exclude_target(&mut db.conn, 999, "ZZZ", None).unwrap_err().is_not_found());
        assert!(exclude_target(&mut db.conn, id, " ", None).unwrap_err().is_validation());
    }

    #[test]
    fn test_clear_exclusion_keeps_in_scope_and_drops_out_of_scope() {
        let mut db = db();
        let u = StaticUniverse::new();
        let id = insight(&mut db.conn);
        include(&mut db.conn, id, "AAA");
        preview_materialized_targets(&mut db.conn, &u, id, 10, true).unwrap();
        exclude_target(&mut db.conn, id, "AAA", None).unwrap();
        exclude_target(&mut db.conn, id, "OUT", None).unwrap();

        let kept = clear_target_exclusion(&mut db.conn, &u, id, "AAA").unwrap().unwrap();
        assert!(!kept.excluded);
        assert_eq!(kept.exclude_reason, None);

        assert_eq!(clear_target_exclusion(&mut db.conn, &u, id, "OUT").unwrap(), None);
        assert_eq!(symbols(&list_targets(&db.conn, id, true).unwrap()), vec!["AAA"]);

        let err = clear_target_exclusion(&mut db.conn, &u, id, "AAA").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let err = preview_materialized_targets(&mut db.conn, &StaticUniverse::new(), id, 0, false)
            .unwrap_err();
        assert!(err.is_validation());
    }
}

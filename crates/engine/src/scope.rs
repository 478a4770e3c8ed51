//! Scope rules and their resolution against the instrument universe.

use std::collections::BTreeSet;

use common::types::{normalize_symbol, ScopeMode, ScopeType};
use common::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::insights::{get_insight, get_mutable_insight};
use crate::now_timestamp;
use crate::universe::InstrumentUniverse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeRule {
    pub id: i64,
    pub insight_id: i64,
    pub scope_type: ScopeType,
    pub scope_key: String,
    pub mode: ScopeMode,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ScopeRuleSpec {
    pub scope_type: ScopeType,
    pub scope_key: String,
    pub mode: ScopeMode,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedScope {
    pub symbols: BTreeSet<String>,
    /// Enabled rules that took part in the resolution.
    pub rule_count: usize,
}

const SELECT_COLUMNS: &str =
    "id, insight_id, scope_type, scope_key, mode, enabled, created_at, updated_at";

struct ScopeRuleRow {
    id: i64,
    insight_id: i64,
    scope_type: String,
    scope_key: String,
    mode: String,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

impl ScopeRuleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            insight_id: row.get(1)?,
            scope_type: row.get(2)?,
            scope_key: row.get(3)?,
            mode: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_rule(self) -> EngineResult<ScopeRule> {
        let scope_type = ScopeType::from_str_loose(&self.scope_type).ok_or_else(|| {
            EngineError::Malformed(format!("scope rule {} has type {:?}", self.id, self.scope_type))
        })?;
        let mode = ScopeMode::from_str_loose(&self.mode).ok_or_else(|| {
            EngineError::Malformed(format!("scope rule {} has mode {:?}", self.id, self.mode))
        })?;
        Ok(ScopeRule {
            id: self.id,
            insight_id: self.insight_id,
            scope_type,
            scope_key: self.scope_key,
            mode,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Symbol keys are normalized like every other symbol; other keys are trimmed.
fn clean_key(scope_type: ScopeType, raw: &str) -> EngineResult<String> {
    if scope_type == ScopeType::Symbol {
        return normalize_symbol(raw).map_err(|_invalid| EngineError::validation("scope_key must not be empty"));
    }
    let key = raw.trim();
    if key.is_empty() {
        return Err(EngineError::validation("scope_key must not be empty"));
    }
    Ok(key.to_string())
}

pub fn get_scope_rule(conn: &Connection, id: i64) -> EngineResult<ScopeRule> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM insight_scope_rules WHERE id = ?1"),
        [id],
        ScopeRuleRow::from_row,
    )
    .optional()?
    .map(ScopeRuleRow::into_rule)
    .transpose()?
    .ok_or_else(|| EngineError::not_found("scope rule", id))
}

/// Create or update the rule identified by (insight, type, key).
pub fn upsert_scope_rule(
    conn: &mut Connection,
    insight_id: i64,
    spec: ScopeRuleSpec,
) -> EngineResult<ScopeRule> {
    let key = clean_key(spec.scope_type, &spec.scope_key)?;
    let tx = conn.transaction()?;
    get_mutable_insight(&tx, insight_id)?;

    let now = now_timestamp();
    tx.execute(
        "INSERT INTO insight_scope_rules (insight_id, scope_type, scope_key, mode, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(insight_id, scope_type, scope_key)
         DO UPDATE SET mode = excluded.mode, enabled = excluded.enabled, updated_at = excluded.updated_at",
        rusqlite::params![
            insight_id,
            spec.scope_type.as_str(),
            key,
            spec.mode.as_str(),
            spec.enabled,
            now,
        ],
    )?;
    let id: i64 = tx.query_row(
        "SELECT id FROM insight_scope_rules WHERE insight_id = ?1 AND scope_type = ?2 AND scope_key = ?3",
        rusqlite::params![insight_id, spec.scope_type.as_str(), key],
        |row| row.get(0),
    )?;
    let rule = get_scope_rule(&tx, id)?;
    tx.commit()?;

    tracing::info!(
        insight_id,
        rule_id = rule.id,
        scope_type = %rule.scope_type,
        scope_key = %rule.scope_key,
        mode = %rule.mode,
        enabled = rule.enabled,
        "scope rule upserted"
    );
    Ok(rule)
}

pub fn remove_scope_rule(conn: &mut Connection, id: i64) -> EngineResult<ScopeRule> {
    let tx = conn.transaction()?;
    let rule = get_scope_rule(&tx, id)?;
    get_mutable_insight(&tx, rule.insight_id)?;
    tx.execute("DELETE FROM insight_scope_rules WHERE id = ?1", [id])?;
    tx.commit()?;
    tracing::info!(insight_id = rule.insight_id, rule_id = id, "scope rule removed");
    Ok(rule)
}

pub fn list_scope_rules(conn: &Connection, insight_id: i64) -> EngineResult<Vec<ScopeRule>> {
    get_insight(conn, insight_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM insight_scope_rules WHERE insight_id = ?1 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([insight_id], ScopeRuleRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ScopeRuleRow::into_rule).collect()
}

/// Union of includes minus union of excludes. Order of the inputs is irrelevant.
pub fn combine(
    includes: impl IntoIterator<Item = BTreeSet<String>>,
    excludes: impl IntoIterator<Item = BTreeSet<String>>,
) -> BTreeSet<String> {
    let mut symbols: BTreeSet<String> = includes.into_iter().flatten().collect();
    for excluded in excludes {
        for symbol in excluded {
            symbols.remove(&symbol);
        }
    }
    symbols
}

/// Evaluate the enabled rules of `insight_id`. Read-only.
pub fn resolve_scope(
    conn: &Connection,
    universe: &dyn InstrumentUniverse,
    insight_id: i64,
) -> EngineResult<ResolvedScope> {
    let rules: Vec<ScopeRule> = list_scope_rules(conn, insight_id)?
        .into_iter()
        .filter(|r| r.enabled)
        .collect();

    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for rule in &rules {
        let matched = universe.matching_symbols(conn, rule.scope_type, &rule.scope_key)?;
        tracing::debug!(
            insight_id,
            rule_id = rule.id,
            matched = matched.len(),
            "scope rule evaluated"
        );
        match rule.mode {
            ScopeMode::Include => includes.push(matched),
            ScopeMode::Exclude => excludes.push(matched),
        }
    }

    Ok(ResolvedScope {
        symbols: combine(includes, excludes),
        rule_count: rules.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{create_insight, remove_insight, NewInsight};
    use crate::test_support::db;
    use crate::universe::{Instrument, StaticUniverse};

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn spec(scope_type: ScopeType, key: &str, mode: ScopeMode) -> ScopeRuleSpec {
        ScopeRuleSpec {
            scope_type,
            scope_key: key.to_string(),
            mode,
            enabled: true,
        }
    }

    fn insight(conn: &mut Connection) -> i64 {
        create_insight(
            conn,
            NewInsight {
                title: "Energy transition".to_string(),
                ..NewInsight::default()
            },
        )
        .unwrap()
        .id
    }

    fn universe() -> StaticUniverse {
        let energy = |symbol: &str| Instrument {
            symbol: symbol.to_string(),
            domain: Some("energy".to_string()),
            ..Instrument::default()
        };
        StaticUniverse::new()
            .with_instrument(energy("XOM"))
            .with_instrument(energy("CVX"))
            .with_instrument(energy("BP"))
    }

    #[test]
    fn test_combine_exclude_wins_in_any_order() {
        let forward = combine(vec![set(&["A", "B"]), set(&["C"])], vec![set(&["B"])]);
        let backward = combine(vec![set(&["C"]), set(&["B", "A"])], vec![set(&["B"])]);
        assert_eq!(forward, set(&["A", "C"]));
        assert_eq!(forward, backward);
        assert!(combine(Vec::new(), vec![set(&["A"])]).is_empty());
    }

    #[test]
    fn test_upsert_is_keyed_by_type_and_key() {
        let mut db = db();
        let id = insight(&mut db.conn);

        let first = upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Symbol, " aaa ", ScopeMode::Include)).unwrap();
        assert_eq!(first.scope_key, "AAA");

        let again = upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Symbol, "AAA", ScopeMode::Exclude)).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.mode, ScopeMode::Exclude);
        assert_eq!(list_scope_rules(&db.conn, id).unwrap().len(), 1);

        let blank = upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Tag, "  ", ScopeMode::Include));
        assert!(blank.unwrap_err().is_validation());
        let missing = upsert_scope_rule(&mut db.conn, 404, spec(ScopeType::Tag, "x", ScopeMode::Include));
        assert!(missing.unwrap_err().is_not_found());
    }

    #[test]
    fn test_rules_on_deleted_insight_are_rejected() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let rule = upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Domain, "energy", ScopeMode::Include)).unwrap();
        remove_insight(&mut db.conn, id).unwrap();

        let err = upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Symbol, "XOM", ScopeMode::Include)).unwrap_err();
        assert!(err.is_validation());
        assert!(remove_scope_rule(&mut db.conn, rule.id).unwrap_err().is_validation());
    }

    #[test]
    fn test_resolve_applies_excludes_and_skips_disabled() {
        let mut db = db();
        let id = insight(&mut db.conn);
        upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Domain, "Energy", ScopeMode::Include)).unwrap();
        upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Symbol, "BP", ScopeMode::Exclude)).unwrap();
        upsert_scope_rule(
            &mut db.conn,
            id,
            ScopeRuleSpec {
                enabled: false,
                ..spec(ScopeType::Symbol, "CVX", ScopeMode::Exclude)
            },
        )
        .unwrap();
        upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Tag, "unknown", ScopeMode::Include)).unwrap();

        let resolved = resolve_scope(&db.conn, &universe(), id).unwrap();
        assert_eq!(resolved.symbols, set(&["CVX", "XOM"]));
        assert_eq!(resolved.rule_count, 3);
    }

    #[test]
    fn test_remove_rule_and_unknown_ids() {
        let mut db = db();
        let id = insight(&mut db.conn);
        let rule = upsert_scope_rule(&mut db.conn, id, spec(ScopeType::Symbol, "XOM", ScopeMode::Include)).unwrap();
        remove_scope_rule(&mut db.conn, rule.id).unwrap();
        assert!(list_scope_rules(&db.conn, id).unwrap().is_empty());
        assert!(remove_scope_rule(&mut db.conn, rule.id).unwrap_err().is_not_found());
        assert!(resolve_scope(&db.conn, &universe(), 77).unwrap_err().is_not_found());
    }
}

//! Base valuation provider: the unadjusted value the evaluator starts from.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use common::types::{format_date, MethodKey};
use common::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseValuation {
    /// The method actually used, resolved when the caller did not name one.
    pub method_key: MethodKey,
    pub value: f64,
    /// Inputs the method had to estimate or skip. Non-empty degrades confidence.
    pub missing_inputs: Vec<String>,
}

pub trait BaseValuationProvider: Send + Sync {
    /// `None` when no valuation exists for the symbol on or before `as_of`.
    fn base_valuation(
        &self,
        conn: &Connection,
        symbol: &str,
        as_of: NaiveDate,
        method_key: Option<&MethodKey>,
    ) -> EngineResult<Option<BaseValuation>>;
}

/// Latest row in `base_valuations` dated on or before the as-of date.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteValuations;

impl BaseValuationProvider for SqliteValuations {
    fn base_valuation(
        &self,
        conn: &Connection,
        symbol: &str,
        as_of: NaiveDate,
        method_key: Option<&MethodKey>,
    ) -> EngineResult<Option<BaseValuation>> {
        let row = conn
            .query_row(
                "SELECT method_key, value, missing_inputs_json
                 FROM base_valuations
                 WHERE symbol = ?1 COLLATE NOCASE AND as_of_date <= ?2 AND (?3 IS NULL OR method_key = ?3)
                 ORDER BY as_of_date DESC, method_key ASC
                 LIMIT 1",
                rusqlite::params![symbol, format_date(as_of), method_key.map(MethodKey::as_str)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((method, value, missing_json)) = row else {
            return Ok(None);
        };
        let method_key = MethodKey::parse(&method).map_err(|_invalid| {
            EngineError::Malformed(format!("base valuation for {symbol} has a blank method_key"))
        })?;
        Ok(Some(BaseValuation {
            method_key,
            value,
            missing_inputs: serde_json::from_str(&missing_json)?,
        }))
    }
}

/// In-memory provider keyed by symbol; ignores the date.
#[derive(Debug, Clone, Default)]
pub struct StaticValuations {
    by_symbol: BTreeMap<String, Vec<BaseValuation>>,
}

impl StaticValuations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, symbol: &str, method_key: &str, value: f64) -> Self {
        self.push(symbol, method_key, value, Vec::new());
        self
    }

    pub fn with_missing_inputs(
        mut self,
        symbol: &str,
        method_key: &str,
        value: f64,
        missing: &[&str],
    ) -> Self {
        let missing = missing.iter().map(|s| (*s).to_string()).collect();
        self.push(symbol, method_key, value, missing);
        self
    }

    fn push(&mut self, symbol: &str, method_key: &str, value: f64, missing_inputs: Vec<String>) {
        if let Ok(method_key) = MethodKey::parse(method_key) {
            self.by_symbol
                .entry(symbol.to_string())
                .or_default()
                .push(BaseValuation {
                    method_key,
                    value,
                    missing_inputs,
                });
        }
    }
}

impl BaseValuationProvider for StaticValuations {
    fn base_valuation(
        &self,
        _conn: &Connection,
        symbol: &str,
        _as_of: NaiveDate,
        method_key: Option<&MethodKey>,
    ) -> EngineResult<Option<BaseValuation>> {
        let Some(candidates) = self.by_symbol.get(symbol) else {
            return Ok(None);
        };
        Ok(match method_key {
            Some(wanted) => candidates.iter().find(|v| &v.method_key == wanted).cloned(),
            None => candidates.first().cloned(),
        })
    }
}

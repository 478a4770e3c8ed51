use crate::error::{EngineError, EngineResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Calendar dates are stored and exchanged as `YYYY-MM-DD`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    Draft,
    Active,
    Archived,
    Deleted,
}

impl InsightStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Symbol,
    Tag,
    Kind,
    AssetClass,
    Market,
    Domain,
    Watchlist,
}

impl ScopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Symbol => "symbol",
            Self::Tag => "tag",
            Self::Kind => "kind",
            Self::AssetClass => "asset_class",
            Self::Market => "market",
            Self::Domain => "domain",
            Self::Watchlist => "watchlist",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "symbol" => Some(Self::Symbol),
            "tag" => Some(Self::Tag),
            "kind" => Some(Self::Kind),
            "asset_class" => Some(Self::AssetClass),
            "market" => Some(Self::Market),
            "domain" => Some(Self::Domain),
            "watchlist" => Some(Self::Watchlist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    Include,
    Exclude,
}

impl ScopeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "include" => Some(Self::Include),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }
}

/// Pipeline position of an effect. Declaration order is application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Base,
    FirstOrder,
    SecondOrder,
    Output,
    Risk,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::FirstOrder => "first_order",
            Self::SecondOrder => "second_order",
            Self::Output => "output",
            Self::Risk => "risk",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Some(Self::Base),
            "first_order" => Some(Self::FirstOrder),
            "second_order" => Some(Self::SecondOrder),
            "output" => Some(Self::Output),
            "risk" => Some(Self::Risk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectOperator {
    Set,
    Add,
    Mul,
    Min,
    Max,
}

impl EffectOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "set" => Some(Self::Set),
            "add" => Some(Self::Add),
            "mul" => Some(Self::Mul),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    /// Fold `value` into the running value `current`.
    pub fn apply(self, current: f64, value: f64) -> f64 {
        match self {
            Self::Set => value,
            Self::Add => current + value,
            Self::Mul => current * value,
            Self::Min => current.min(value),
            Self::Max => current.max(value),
        }
    }
}

macro_rules! display_and_parse {
    ($ty:ty, $label:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_str_loose(s)
                    .ok_or_else(|| EngineError::validation(format!("invalid {}: {s:?}", $label)))
            }
        }
    };
}

display_and_parse!(InsightStatus, "status");
display_and_parse!(ScopeType, "scope_type");
display_and_parse!(ScopeMode, "mode");
display_and_parse!(Stage, "stage");
display_and_parse!(EffectOperator, "operator");

/// Identifies the valuation method an effect channel targets. `*` matches every method.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MethodKey(String);

impl MethodKey {
    pub const WILDCARD: &'static str = "*";

    pub fn parse(raw: &str) -> EngineResult<Self> {
        non_empty("method_key", raw).map(Self)
    }

    pub fn wildcard() -> Self {
        Self(Self::WILDCARD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifies one output metric of a valuation method.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MetricKey(String);

impl MetricKey {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        non_empty("metric_key", raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn non_empty(field: &str, raw: &str) -> EngineResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Trimmed, upper-cased instrument symbol.
pub fn normalize_symbol(raw: &str) -> EngineResult<String> {
    non_empty("symbol", raw).map(|s| s.to_ascii_uppercase())
}

pub fn parse_date(field: &str, raw: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_parse_err| {
        EngineError::validation(format!("{field} must be a YYYY-MM-DD date, got {raw:?}"))
    })
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn require_finite(field: &str, value: f64) -> EngineResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::validation(format!(
            "{field} must be a finite number"
        )))
    }
}

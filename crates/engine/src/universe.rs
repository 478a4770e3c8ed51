//! Instrument universe: which symbols a scope rule key refers to.

use std::collections::{BTreeMap, BTreeSet};

use common::types::{normalize_symbol, ScopeType};
use common::EngineResult;
use rusqlite::Connection;

/// Resolves one (scope type, key) pair to the symbols it matches.
///
/// Implementations receive the connection the caller is already reading from
/// so a whole resolution sees one snapshot. Keys that match nothing yield an
/// empty set.
pub trait InstrumentUniverse: Send + Sync {
    fn matching_symbols(
        &self,
        conn: &Connection,
        scope_type: ScopeType,
        key: &str,
    ) -> EngineResult<BTreeSet<String>>;
}

/// Upper-cases reference symbols so they match evaluation and exclusion
/// lookups. Blank symbols are dropped.
fn normalized<I>(symbols: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = String>,
{
    symbols
        .into_iter()
        .filter_map(|s| normalize_symbol(&s).ok())
        .collect()
}

/// Reads the `instruments`, `instrument_tags` and `watchlist_members` tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteUniverse;

impl InstrumentUniverse for SqliteUniverse {
    fn matching_symbols(
        &self,
        conn: &Connection,
        scope_type: ScopeType,
        key: &str,
    ) -> EngineResult<BTreeSet<String>> {
        let sql = match scope_type {
            ScopeType::Symbol => return Ok(normalized([key.to_string()])),
            ScopeType::Tag => "SELECT symbol FROM instrument_tags WHERE tag = ?1 COLLATE NOCASE",
            ScopeType::Kind => "SELECT symbol FROM instruments WHERE kind = ?1 COLLATE NOCASE",
            ScopeType::AssetClass => {
                "SELECT symbol FROM instruments WHERE asset_class = ?1 COLLATE NOCASE"
            }
            ScopeType::Market => "SELECT symbol FROM instruments WHERE market = ?1 COLLATE NOCASE",
            ScopeType::Domain => "SELECT symbol FROM instruments WHERE domain = ?1 COLLATE NOCASE",
            ScopeType::Watchlist => {
                "SELECT symbol FROM watchlist_members WHERE watchlist = ?1 COLLATE NOCASE"
            }
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let symbols = stmt
            .query_map([key], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(normalized(symbols))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Instrument {
    pub symbol: String,
    pub kind: Option<String>,
    pub asset_class: Option<String>,
    pub market: Option<String>,
    pub domain: Option<String>,
    pub tags: Vec<String>,
}

/// Fixed in-memory universe for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticUniverse {
    instruments: Vec<Instrument>,
    watchlists: BTreeMap<String, BTreeSet<String>>,
}

impl StaticUniverse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrument(mut self, instrument: Instrument) -> Self {
        self.instruments.push(instrument);
        self
    }

    pub fn with_watchlist(mut self, name: &str, symbols: &[&str]) -> Self {
        self.watchlists
            .entry(name.to_ascii_lowercase())
            .or_default()
            .extend(symbols.iter().map(|s| (*s).to_string()));
        self
    }
}

fn eq_nocase(field: Option<&str>, key: &str) -> bool {
    field.is_some_and(|f| f.eq_ignore_ascii_case(key))
}

impl InstrumentUniverse for StaticUniverse {
    fn matching_symbols(
        &self,
        _conn: &Connection,
        scope_type: ScopeType,
        key: &str,
    ) -> EngineResult<BTreeSet<String>> {
        if scope_type == ScopeType::Symbol {
            return Ok(normalized([key.to_string()]));
        }
        if scope_type == ScopeType::Watchlist {
            return Ok(normalized(
                self.watchlists
                    .get(&key.to_ascii_lowercase())
                    .cloned()
                    .unwrap_or_default(),
            ));
        }
        let matched = self
            .instruments
            .iter()
            .filter(|i| match scope_type {
                ScopeType::Tag => i.tags.iter().any(|t| t.eq_ignore_ascii_case(key)),
                ScopeType::Kind => eq_nocase(i.kind.as_deref(), key),
                ScopeType::AssetClass => eq_nocase(i.asset_class.as_deref(), key),
                ScopeType::Market => eq_nocase(i.market.as_deref(), key),
                ScopeType::Domain => eq_nocase(i.domain.as_deref(), key),
                ScopeType::Symbol | ScopeType::Watchlist => false,
            })
            .map(|i| i.symbol.clone());
        Ok(normalized(matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db;

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO instruments (symbol, kind, asset_class, market, domain) VALUES
                ('XOM', 'equity', 'equities', 'XNYS', 'energy'),
                ('CVX', 'equity', 'equities', 'XNYS', 'energy'),
                ('XLE', 'etf', 'equities', 'ARCX', 'energy'),
                ('TLT', 'etf', 'rates', 'XNAS', 'duration');
             INSERT INTO instrument_tags (symbol, tag) VALUES
                ('XOM', 'oil'), ('CVX', 'oil'), ('TLT', 'treasuries');
             INSERT INTO watchlist_members (watchlist, symbol) VALUES
                ('Core', 'XOM'), ('Core', 'TLT');",
        )
        .unwrap();
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_sqlite_universe_matches_each_scope_type() {
        let db = db();
        seed(&db.conn);
        let u = SqliteUniverse;
        let m = |t, k| u.matching_symbols(&db.conn, t, k).unwrap();

        assert_eq!(m(ScopeType::Symbol, "ANY"), set(&["ANY"]));
        assert_eq!(m(ScopeType::Tag, "OIL"), set(&["CVX", "XOM"]));
        assert_eq!(m(ScopeType::Kind, "etf"), set(&["TLT", "XLE"]));
        assert_eq!(m(ScopeType::AssetClass, "rates"), set(&["TLT"]));
        assert_eq!(m(ScopeType::Market, "xnys"), set(&["CVX", "XOM"]));
        assert_eq!(m(ScopeType::Domain, "Energy"), set(&["CVX", "XLE", "XOM"]));
        assert_eq!(m(ScopeType::Watchlist, "core"), set(&["TLT", "XOM"]));
        assert!(m(ScopeType::Tag, "nothing").is_empty());
    }

    #[test]
    fn test_static_universe_mirrors_sqlite_semantics() {
        let db = db();
        let u = StaticUniverse::new()
            .with_instrument(Instrument {
                symbol: "AAA".to_string(),
                kind: Some("equity".to_string()),
                domain: Some("Tech".to_string()),
                tags: vec!["growth".to_string()],
                ..Instrument::default()
            })
            .with_instrument(Instrument {
                symbol: "BBB".to_string(),
                kind: Some("bond".to_string()),
                ..Instrument::default()
            })
            .with_watchlist("Focus", &["AAA", "ZZZ"]);
        let m = |t, k| u.matching_symbols(&db.conn, t, k).unwrap();

        assert_eq!(m(ScopeType::Kind, "EQUITY"), set(&["AAA"]));
        assert_eq!(m(ScopeType::Tag, "Growth"), set(&["AAA"]));
        assert_eq!(m(ScopeType::Domain, "tech"), set(&["AAA"]));
        assert_eq!(m(ScopeType::Watchlist, "focus"), set(&["AAA", "ZZZ"]));
        assert!(m(ScopeType::Market, "XNAS").is_empty());
    }

    #[test]
    fn test_reference_symbols_come_back_upper_case() {
        let db = db();
        db.conn
            .execute_batch(
                "INSERT INTO instruments (symbol, domain) VALUES ('aaa', 'semis'), (' bbb ', 'semis');
                 INSERT INTO instrument_tags (symbol, tag) VALUES ('aaa', 'fabs');
                 INSERT INTO watchlist_members (watchlist, symbol) VALUES ('core', 'bbb');",
            )
            .unwrap();
        let u = SqliteUniverse;
        let m = |t, k| u.matching_symbols(&db.conn, t, k).unwrap();

        assert_eq!(m(ScopeType::Domain, "semis"), set(&["AAA", "BBB"]));
        assert_eq!(m(ScopeType::Tag, "fabs"), set(&["AAA"]));
        assert_eq!(m(ScopeType::Watchlist, "core"), set(&["BBB"]));
        assert_eq!(m(ScopeType::Symbol, " aaa "), set(&["AAA"]));

        let s = StaticUniverse::new()
            .with_instrument(Instrument {
                symbol: "ccc".to_string(),
                kind: Some("equity".to_string()),
                ..Instrument::default()
            })
            .with_watchlist("focus", &["ddd"]);
        assert_eq!(s.matching_symbols(&db.conn, ScopeType::Kind, "equity").unwrap(), set(&["CCC"]));
        assert_eq!(s.matching_symbols(&db.conn, ScopeType::Watchlist, "focus").unwrap(), set(&["DDD"]));
        assert_eq!(s.matching_symbols(&db.conn, ScopeType::Symbol, "ccc").unwrap(), set(&["CCC"]));
    }
}

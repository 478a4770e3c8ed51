use common::types::InsightStatus;
use common::{EngineError, EngineResult};
use rusqlite::Connection;
use serde::Serialize;

use crate::insights::Insight;
use crate::{check_page, Page};

pub const HIGHLIGHT_OPEN: &str = "<mark>";
pub const HIGHLIGHT_CLOSE: &str = "</mark>";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub insight_id: i64,
    pub title: String,
    pub status: InsightStatus,
    pub snippet: String,
    /// Higher is more relevant (negated bm25).
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub limit: usize,
    pub offset: usize,
    pub snippet_tokens: u32,
}

/// Replace the index entry for `insight`. Deleted insights are dropped instead.
pub fn reindex_insight(conn: &Connection, insight: &Insight) -> EngineResult<()> {
    unindex_insight(conn, insight.id)?;
    if insight.status == InsightStatus::Deleted {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO insights_fts (rowid, title, thesis, tags) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            insight.id,
            insight.title,
            insight.thesis.as_deref().unwrap_or(""),
            insight.tags.join(" "),
        ],
    )?;
    Ok(())
}

pub fn unindex_insight(conn: &Connection, insight_id: i64) -> EngineResult<()> {
    conn.execute("DELETE FROM insights_fts WHERE rowid = ?1", [insight_id])?;
    Ok(())
}

/// Turn free text into an FTS5 expression: every word must match as a prefix.
/// Punctuation is dropped so user input can never inject FTS5 syntax.
pub fn to_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

pub fn search(conn: &Connection, q: &SearchQuery) -> EngineResult<Page<SearchHit>> {
    let limit = check_page(q.limit)?;
    let Some(expr) = to_match_expression(&q.query) else {
        return Ok(Page {
            items: Vec::new(),
            total: 0,
            limit,
            offset: q.offset,
        });
    };

    let total: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM insights_fts f JOIN insights i ON i.id = f.rowid
         WHERE insights_fts MATCH ?1 AND i.status != 'deleted'",
        [&expr],
        |row| row.get(0),
    )?;

    let tokens = q.snippet_tokens.clamp(1, 64);
    let mut stmt = conn.prepare(&format!(
        "SELECT i.id, i.title, i.status,
                snippet(insights_fts, -1, '{HIGHLIGHT_OPEN}', '{HIGHLIGHT_CLOSE}', '…', {tokens}),
                bm25(insights_fts) AS rank
         FROM insights_fts f JOIN insights i ON i.id = f.rowid
         WHERE insights_fts MATCH ?1 AND i.status != 'deleted'
         ORDER BY rank ASC, i.id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt
        .query_map(
            rusqlite::params![expr, limit as i64, q.offset as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let items = rows
        .into_iter()
        .map(|(insight_id, title, status, snippet, rank)| {
            let status = InsightStatus::from_str_loose(&status).ok_or_else(|| {
                EngineError::Malformed(format!("insight {insight_id} has status {status:?}"))
            })?;
            Ok(SearchHit {
                insight_id,
                title,
                status,
                snippet,
                score: -rank,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(Page {
        items,
        total: total.max(0) as u64,
        limit,
        offset: q.offset,
    })
}

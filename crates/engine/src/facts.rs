//! Free-text drafting notes. Never read by the evaluator.

use common::{EngineError, EngineResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::{check_page, now_timestamp, Page};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fact {
    pub id: i64,
    pub body: String,
    pub created_at: String,
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        body: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn find_fact(conn: &Connection, id: i64) -> EngineResult<Option<Fact>> {
    Ok(conn
        .query_row(
            "SELECT id, body, created_at FROM facts WHERE id = ?1",
            [id],
            fact_from_row,
        )
        .optional()?)
}

pub fn create_fact(conn: &Connection, body: &str) -> EngineResult<Fact> {
    let body = body.trim();
    if body.is_empty() {
        return Err(EngineError::validation("body must not be empty"));
    }
    conn.execute(
        "INSERT INTO facts (body, created_at) VALUES (?1, ?2)",
        rusqlite::params![body, now_timestamp()],
    )?;
    find_fact(conn, conn.last_insert_rowid())?
        .ok_or_else(|| EngineError::not_found("fact", conn.last_insert_rowid()))
}

/// Newest first.
pub fn list_facts(conn: &Connection, limit: usize, offset: usize) -> EngineResult<Page<Fact>> {
    let limit = check_page(limit)?;
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))?;
    let mut stmt = conn.prepare(
        "SELECT id, body, created_at FROM facts ORDER BY id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let items = stmt
        .query_map(rusqlite::params![limit as i64, offset as i64], fact_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page {
        items,
        total: total.max(0) as u64,
        limit,
        offset,
    })
}

pub fn remove_fact(conn: &Connection, id: i64) -> EngineResult<Fact> {
    let fact = find_fact(conn, id)?.ok_or_else(|| EngineError::not_found("fact", id))?;
    conn.execute("DELETE FROM facts WHERE id = ?1", [id])?;
    Ok(fact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db;

    #[test]
    fn test_fact_crud() {
        let db = db();
        let first = create_fact(&db.conn, "  Fed minutes lean dovish ").unwrap();
        assert_eq!(first.body, "Fed minutes lean dovish");
        let second = create_fact(&db.conn, "Copper inventories falling").unwrap();

        let page = list_facts(&db.conn, 10, 0).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, second.id);

        remove_fact(&db.conn, first.id).unwrap();
        assert!(remove_fact(&db.conn, first.id).unwrap_err().is_not_found());
        assert_eq!(list_facts(&db.conn, 10, 0).unwrap().total, 1);
    }

    #[test]
    fn test_blank_fact_rejected() {
        let db = db();
        assert!(create_fact(&db.conn, "   ").unwrap_err().is_validation());
    }
}

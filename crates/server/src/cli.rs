use anyhow::Result;
use chrono::NaiveDate;
use common::db::Database;
use common::types::{format_date, parse_date, MethodKey};
use engine::insights::{list_insights, Insight, InsightQuery};
use engine::materialize::{preview_materialized_targets, MaterializationPreview};
use engine::search::{search, SearchHit, SearchQuery};
use engine::valuation::{compute_valuation_adjustment, ValuationAdjustmentResult};
use engine::EngineSettings;
use engine::{base_valuation::SqliteValuations, universe::SqliteUniverse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Insights,
    Materialize {
        insight_id: i64,
        persist: bool,
    },
    Evaluate {
        symbol: String,
        date: Option<NaiveDate>,
        method: Option<String>,
    },
    Search {
        query: String,
    },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "insights" => Ok(Command::Insights),
        "materialize" => {
            let usage = || "usage: server materialize <insight-id> [--persist]".to_string();
            let insight_id = args
                .next()
                .ok_or_else(usage)?
                .parse::<i64>()
                .map_err(|_invalid| usage())?;
            let persist = match args.next().as_deref() {
                None => false,
                Some("--persist") => true,
                Some(other) => return Err(format!("unknown flag: {other}")),
            };
            Ok(Command::Materialize {
                insight_id,
                persist,
            })
        }
        "evaluate" => {
            let symbol = args.next().ok_or_else(|| {
                "usage: server evaluate <symbol> [YYYY-MM-DD] [method]".to_string()
            })?;
            let date = args
                .next()
                .map(|raw| parse_date("date", &raw).map_err(|err| format!("bad date: {err}")))
                .transpose()?;
            Ok(Command::Evaluate {
                symbol,
                date,
                method: args.next(),
            })
        }
        "search" => {
            let words: Vec<String> = args.collect();
            if words.is_empty() {
                return Err("usage: server search <query>".to_string());
            }
            Ok(Command::Search {
                query: words.join(" "),
            })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

pub fn run_command(db: &mut Database, settings: &EngineSettings, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Insights => show_insights(db),
        Command::Materialize {
            insight_id,
            persist,
        } => show_materialization(db, settings, insight_id, persist),
        Command::Evaluate {
            symbol,
            date,
            method,
        } => show_evaluation(db, settings, &symbol, date, method.as_deref()),
        Command::Search { query } => show_search(db, settings, &query),
    }
}

pub fn query_insights(db: &Database) -> Result<Vec<Insight>> {
    let page = list_insights(
        &db.conn,
        &InsightQuery {
            query: None,
            status: None,
            limit: 200,
            offset: 0,
        },
    )?;
    Ok(page.items)
}

fn show_insights(db: &Database) -> Result<()> {
    println!("Insights (newest first):");
    for i in query_insights(db)? {
        let window = match (i.valid_from, i.valid_to) {
            (None, None) => "open".to_string(),
            (from, to) => format!(
                "{}..{}",
                from.map(format_date).unwrap_or_default(),
                to.map(format_date).unwrap_or_default()
            ),
        };
        println!(
            "{:>5}  {:<8}  {window:<23}  {}",
            i.id,
            i.status.as_str(),
            i.title
        );
    }
    Ok(())
}

pub fn materialize(
    db: &mut Database,
    settings: &EngineSettings,
    insight_id: i64,
    persist: bool,
) -> Result<MaterializationPreview> {
    Ok(preview_materialized_targets(
        &mut db.conn,
        &SqliteUniverse,
        insight_id,
        settings.max_preview_limit,
        persist,
    )?)
}

fn show_materialization(
    db: &mut Database,
    settings: &EngineSettings,
    insight_id: i64,
    persist: bool,
) -> Result<()> {
    let p = materialize(db, settings, insight_id, persist)?;
    println!(
        "Insight {}: {} target(s) from {} rule(s), {} excluded{}",
        p.insight_id,
        p.total,
        p.rule_count,
        p.excluded_count,
        if p.persisted { ", persisted" } else { " (preview)" }
    );
    for symbol in &p.symbols {
        println!("  {symbol}");
    }
    if p.truncated {
        println!("  ... {} more", p.total - p.symbols.len());
    }
    Ok(())
}

pub fn evaluate(
    db: &Database,
    settings: &EngineSettings,
    symbol: &str,
    date: Option<NaiveDate>,
    method: Option<&str>,
) -> Result<ValuationAdjustmentResult> {
    let as_of = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
    let method = method.map(MethodKey::parse).transpose()?;
    Ok(compute_valuation_adjustment(
        &db.conn,
        &SqliteValuations,
        settings.confidence_penalties,
        symbol,
        as_of,
        method.as_ref(),
    )?)
}

fn show_evaluation(
    db: &Database,
    settings: &EngineSettings,
    symbol: &str,
    date: Option<NaiveDate>,
    method: Option<&str>,
) -> Result<()> {
    let r = evaluate(db, settings, symbol, date, method)?;
    println!("{} as of {}", r.symbol, r.as_of_date);
    if r.not_applicable {
        println!("  not applicable: {}", r.reason.unwrap_or_default());
        return Ok(());
    }
    let method = r.method_key.as_ref().map_or("", MethodKey::as_str);
    println!(
        "  method={method}  base={:.4}  adjusted={:.4}  confidence={:.2}",
        r.base_value.unwrap_or_default(),
        r.adjusted_value.unwrap_or_default(),
        r.confidence.unwrap_or_default()
    );
    for e in &r.applied_effects {
        println!(
            "  {:<12} {:<3} {:>10.4}  p={}  #{} {}",
            e.stage.as_str(),
            e.operator.as_str(),
            e.value,
            e.priority,
            e.insight_id,
            e.insight_title
        );
    }
    for reason in &r.degradation_reasons {
        println!("  degraded: {reason}");
    }
    Ok(())
}

pub fn query_search(
    db: &Database,
    settings: &EngineSettings,
    query: &str,
) -> Result<Vec<SearchHit>> {
    let page = search(
        &db.conn,
        &SearchQuery {
            query: query.to_string(),
            limit: settings.search_max_limit,
            offset: 0,
            snippet_tokens: settings.snippet_tokens,
        },
    )?;
    Ok(page.items)
}

fn show_search(db: &Database, settings: &EngineSettings, query: &str) -> Result<()> {
    println!("Search: {query}");
    for h in query_search(db, settings, query)? {
        println!("{:>5}  {:>7.3}  {}  {}", h.insight_id, h.score, h.title, h.snippet);
    }
    Ok(())
}

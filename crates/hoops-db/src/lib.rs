//! PostgreSQL persistence for derived records and aggregates.

use anyhow::Context;
use chrono::NaiveDate;
use hoops_core::{columns, DbConfig, DerivedFrame, DerivedRecord, Metric, SummaryColumn, SummaryKind, SummaryTable};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Postgres, QueryBuilder};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hoops-db";

pub const INSERT_BATCH_SIZE: usize = 100;

/// Connection state of the relational store. Loads against a disconnected
/// store are skipped rather than failed.
#[derive(Debug)]
pub enum Database {
    Disconnected,
    Connected(PgConnection),
}

impl Database {
    /// Connect with `config`; `None` (database disabled) or a failed connect
    /// yields `Disconnected`.
    pub async fn connect(config: Option<&DbConfig>) -> Self {
        let Some(config) = config else {
            info!("database disabled; loads will be skipped");
            return Database::Disconnected;
        };
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user);
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        match PgConnection::connect_with(&options).await {
            Ok(conn) => {
                info!(target_db = %config, "connected to database");
                Database::Connected(conn)
            }
            Err(err) => {
                warn!(target_db = %config, error = %err, "database unavailable; loads will be skipped");
                Database::Disconnected
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Database::Connected(_))
    }
}

/// Where a table column's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    SeasonYear,
    TeamId,
    TeamName,
    GameDate,
    Matchup,
    Wl,
    Stat(&'static str),
    Metric(Metric),
    SummaryKey,
    Summary(SummaryColumn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub source: ColumnSource,
}

const fn col(name: &'static str, sql_type: &'static str, source: ColumnSource) -> ColumnDef {
    ColumnDef {
        name,
        sql_type,
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    /// Serial `id` primary key for record tables.
    pub serial_id: bool,
    /// Natural primary key of summary tables; inserts are skipped when the
    /// live table lacks it.
    pub key_column: Option<&'static str>,
    pub columns: &'static [ColumnDef],
}

impl TableSchema {
    pub fn create_sql(&self) -> String {
        let mut defs = Vec::with_capacity(self.columns.len() + 2);
        if self.serial_id {
            defs.push("id SERIAL PRIMARY KEY".to_string());
        }
        for column in self.columns {
            if Some(column.name) == self.key_column {
                defs.push(format!("{} {} PRIMARY KEY", column.name, column.sql_type));
            } else {
                defs.push(format!("{} {}", column.name, column.sql_type));
            }
        }
        defs.push("created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP".to_string());
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, defs.join(", "))
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

const IDENTITY_COLUMNS: [ColumnDef; 6] = [
    col("season_year", "VARCHAR(10)", ColumnSource::SeasonYear),
    col("team_id", "BIGINT", ColumnSource::TeamId),
    col("team_name", "VARCHAR(100)", ColumnSource::TeamName),
    col("game_date", "DATE", ColumnSource::GameDate),
    col("matchup", "VARCHAR(50)", ColumnSource::Matchup),
    col("wl", "VARCHAR(1)", ColumnSource::Wl),
];

pub const DETAILED_TABLE: TableSchema = TableSchema {
    name: "nba_playoffs_detailed",
    serial_id: true,
    key_column: None,
    columns: &[
        IDENTITY_COLUMNS[0],
        IDENTITY_COLUMNS[1],
        IDENTITY_COLUMNS[2],
        IDENTITY_COLUMNS[3],
        IDENTITY_COLUMNS[4],
        IDENTITY_COLUMNS[5],
        col("pts", "DOUBLE PRECISION", ColumnSource::Stat(columns::PTS)),
        col("fg3m", "DOUBLE PRECISION", ColumnSource::Stat(columns::FG3M)),
        col("ast", "DOUBLE PRECISION", ColumnSource::Stat(columns::AST)),
        col("offensive_efficiency", "DOUBLE PRECISION", ColumnSource::Metric(Metric::OffensiveEfficiency)),
        col("defensive_rating", "DOUBLE PRECISION", ColumnSource::Metric(Metric::DefensiveRating)),
        col("plus_minus_per_min", "DOUBLE PRECISION", ColumnSource::Metric(Metric::PlusMinusPerMin)),
        col("ast_to_ratio", "DOUBLE PRECISION", ColumnSource::Metric(Metric::AstToRatio)),
    ],
};

pub const SEASON_SUMMARY_TABLE: TableSchema = TableSchema {
    name: "nba_playoffs_season_summary",
    serial_id: false,
    key_column: Some("season_year"),
    columns: &[
        col("season_year", "VARCHAR(10)", ColumnSource::SummaryKey),
        col("avg_pts", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgPts)),
        col("avg_fg3m", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgFg3m)),
        col("avg_ast", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgAst)),
        col("avg_off_efficiency", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgOffEfficiency)),
        col("avg_def_rating", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgDefRating)),
    ],
};

pub const TEAM_SUMMARY_TABLE: TableSchema = TableSchema {
    name: "nba_playoffs_team_summary",
    serial_id: false,
    key_column: Some("team_name"),
    columns: &[
        col("team_name", "VARCHAR(100)", ColumnSource::SummaryKey),
        col("avg_pts", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgPts)),
        col("win_rate", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::WinRate)),
        col("avg_off_efficiency", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgOffEfficiency)),
        col("avg_def_rating", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgDefRating)),
    ],
};

pub const ADVANCED_TABLE: TableSchema = TableSchema {
    name: "nba_playoffs_advanced",
    serial_id: true,
    key_column: None,
    columns: &[
        IDENTITY_COLUMNS[0],
        IDENTITY_COLUMNS[1],
        IDENTITY_COLUMNS[2],
        IDENTITY_COLUMNS[3],
        IDENTITY_COLUMNS[4],
        IDENTITY_COLUMNS[5],
        col("pts", "DOUBLE PRECISION", ColumnSource::Stat(columns::PTS)),
        col("ast", "DOUBLE PRECISION", ColumnSource::Stat(columns::AST)),
        col("fg3m", "DOUBLE PRECISION", ColumnSource::Stat(columns::FG3M)),
        col("reb", "DOUBLE PRECISION", ColumnSource::Stat(columns::REB)),
        col("fg_pct", "DOUBLE PRECISION", ColumnSource::Stat(columns::FG_PCT)),
        col("fg3_pct", "DOUBLE PRECISION", ColumnSource::Stat(columns::FG3_PCT)),
        col("offensive_efficiency", "DOUBLE PRECISION", ColumnSource::Metric(Metric::OffensiveEfficiency)),
        col("defensive_rating", "DOUBLE PRECISION", ColumnSource::Metric(Metric::DefensiveRating)),
        col("plus_minus_per_min", "DOUBLE PRECISION", ColumnSource::Metric(Metric::PlusMinusPerMin)),
        col("ast_to_ratio", "DOUBLE PRECISION", ColumnSource::Metric(Metric::AstToRatio)),
        col("playoff_efficiency", "DOUBLE PRECISION", ColumnSource::Metric(Metric::PlayoffEfficiency)),
    ],
};

const ALL_SUMMARY_VALUE_COLUMNS: [ColumnDef; 10] = [
    col("avg_pts", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgPts)),
    col("avg_fg3m", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgFg3m)),
    col("avg_ast", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgAst)),
    col("avg_reb", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgReb)),
    col("avg_fg_pct", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgFgPct)),
    col("avg_fg3_pct", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgFg3Pct)),
    col("win_rate", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::WinRate)),
    col("avg_off_efficiency", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgOffEfficiency)),
    col("avg_def_rating", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgDefRating)),
    col("avg_playoff_efficiency", "DOUBLE PRECISION", ColumnSource::Summary(SummaryColumn::AvgPlayoffEfficiency)),
];

/// Season summary shape created by the advanced load when the table is missing.
pub const ADVANCED_SEASON_SUMMARY_TABLE: TableSchema = TableSchema {
    name: "nba_playoffs_season_summary",
    serial_id: false,
    key_column: Some("season_year"),
    columns: &[
        col("season_year", "VARCHAR(10)", ColumnSource::SummaryKey),
        ALL_SUMMARY_VALUE_COLUMNS[0],
        ALL_SUMMARY_VALUE_COLUMNS[1],
        ALL_SUMMARY_VALUE_COLUMNS[2],
        ALL_SUMMARY_VALUE_COLUMNS[3],
        ALL_SUMMARY_VALUE_COLUMNS[4],
        ALL_SUMMARY_VALUE_COLUMNS[5],
        ALL_SUMMARY_VALUE_COLUMNS[6],
        ALL_SUMMARY_VALUE_COLUMNS[7],
        ALL_SUMMARY_VALUE_COLUMNS[8],
        ALL_SUMMARY_VALUE_COLUMNS[9],
    ],
};

pub const ADVANCED_TEAM_SUMMARY_TABLE: TableSchema = TableSchema {
    name: "nba_playoffs_team_summary",
    serial_id: false,
    key_column: Some("team_name"),
    columns: &[
        col("team_name", "VARCHAR(100)", ColumnSource::SummaryKey),
        ALL_SUMMARY_VALUE_COLUMNS[0],
        ALL_SUMMARY_VALUE_COLUMNS[1],
        ALL_SUMMARY_VALUE_COLUMNS[2],
        ALL_SUMMARY_VALUE_COLUMNS[3],
        ALL_SUMMARY_VALUE_COLUMNS[4],
        ALL_SUMMARY_VALUE_COLUMNS[5],
        ALL_SUMMARY_VALUE_COLUMNS[6],
        ALL_SUMMARY_VALUE_COLUMNS[7],
        ALL_SUMMARY_VALUE_COLUMNS[8],
        ALL_SUMMARY_VALUE_COLUMNS[9],
    ],
};

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    BigInt(Option<i64>),
    Float(Option<f64>),
    Date(Option<NaiveDate>),
}

fn push_value(builder: &mut Separated<'_, '_, Postgres, &'static str>, value: SqlValue) {
    match value {
        SqlValue::Text(v) => {
            builder.push_bind(v);
        }
        SqlValue::BigInt(v) => {
            builder.push_bind(v);
        }
        SqlValue::Float(v) => {
            builder.push_bind(v);
        }
        SqlValue::Date(v) => {
            builder.push_bind(v);
        }
    }
}

/// Value of a record-table column for one derived record. Input columns that
/// exist are zero-filled; absent ones are NULL.
pub fn record_value(frame: &DerivedFrame, record: &DerivedRecord, source: ColumnSource) -> SqlValue {
    let raw = &record.raw;
    match source {
        ColumnSource::SeasonYear => SqlValue::Text(raw.season_year.clone()),
        ColumnSource::TeamId => SqlValue::BigInt(raw.team_id),
        ColumnSource::TeamName => SqlValue::Text(raw.team_name.clone()),
        ColumnSource::GameDate => SqlValue::Date(record.game_date),
        ColumnSource::Matchup => SqlValue::Text(raw.matchup.clone()),
        ColumnSource::Wl => SqlValue::Text(raw.wl.clone()),
        ColumnSource::Stat(column) => {
            SqlValue::Float(frame.has_column(column).then(|| raw.stat_or_zero(column)))
        }
        ColumnSource::Metric(metric) => SqlValue::Float(record.metric(metric)),
        ColumnSource::SummaryKey | ColumnSource::Summary(_) => SqlValue::Float(None),
    }
}

fn summary_value(table: &SummaryTable, row_index: usize, source: ColumnSource) -> SqlValue {
    let row = &table.rows[row_index];
    match source {
        ColumnSource::SummaryKey => SqlValue::Text(row.key.clone()),
        ColumnSource::Summary(column) => SqlValue::Float(
            table
                .columns
                .iter()
                .position(|c| *c == column)
                .and_then(|i| row.values.get(i).copied())
                .filter(|v| v.is_finite()),
        ),
        _ => SqlValue::Float(None),
    }
}

/// Whether the derived frame can supply values for `source`.
pub fn frame_provides(frame: &DerivedFrame, source: ColumnSource) -> bool {
    match source {
        ColumnSource::SeasonYear => frame.has_column(columns::SEASON_YEAR),
        ColumnSource::TeamId => frame.has_column(columns::TEAM_ID),
        ColumnSource::TeamName => frame.has_column(columns::TEAM_NAME),
        ColumnSource::GameDate => frame.has_column(columns::GAME_DATE),
        ColumnSource::Matchup => frame.has_column(columns::MATCHUP),
        ColumnSource::Wl => frame.has_column(columns::WL),
        ColumnSource::Stat(column) => frame.has_column(column),
        ColumnSource::Metric(metric) => frame.has_metric(metric),
        ColumnSource::SummaryKey | ColumnSource::Summary(_) => false,
    }
}

pub fn summary_provides(table: &SummaryTable, source: ColumnSource) -> bool {
    match source {
        ColumnSource::SummaryKey => true,
        ColumnSource::Summary(column) => table.columns.contains(&column),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    pub table: &'static str,
    pub columns: Vec<ColumnDef>,
}

impl InsertPlan {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanSkip {
    MissingKeyColumn(&'static str),
    NoOverlap,
}

/// Intersect the columns we can supply with the columns the live table has.
pub fn plan_insert(
    schema: &TableSchema,
    live_columns: &[String],
    provides: impl Fn(ColumnSource) -> bool,
) -> Result<InsertPlan, PlanSkip> {
    let is_live = |name: &str| live_columns.iter().any(|c| c.eq_ignore_ascii_case(name));
    if let Some(key) = schema.key_column {
        if !is_live(key) {
            return Err(PlanSkip::MissingKeyColumn(key));
        }
    }
    let columns = schema
        .columns
        .iter()
        .filter(|c| is_live(c.name) && provides(c.source))
        .copied()
        .collect::<Vec<_>>();
    let has_values = columns
        .iter()
        .any(|c| Some(c.name) != schema.key_column);
    if !has_values {
        return Err(PlanSkip::NoOverlap);
    }
    Ok(InsertPlan {
        table: schema.name,
        columns,
    })
}

pub fn record_rows(frame: &DerivedFrame, plan: &InsertPlan) -> Vec<Vec<SqlValue>> {
    frame
        .records
        .iter()
        .map(|record| {
            plan.columns
                .iter()
                .map(|c| record_value(frame, record, c.source))
                .collect()
        })
        .collect()
}

pub fn summary_rows(table: &SummaryTable, plan: &InsertPlan) -> Vec<Vec<SqlValue>> {
    (0..table.rows.len())
        .map(|i| {
            plan.columns
                .iter()
                .map(|c| summary_value(table, i, c.source))
                .collect()
        })
        .collect()
}

fn full_plan(schema: &TableSchema) -> InsertPlan {
    InsertPlan {
        table: schema.name,
        columns: schema.columns.to_vec(),
    }
}

/// Multi-row inserts of at most [`INSERT_BATCH_SIZE`] rows per statement.
pub async fn insert_batched(
    conn: &mut PgConnection,
    plan: &InsertPlan,
    rows: Vec<Vec<SqlValue>>,
) -> anyhow::Result<u64> {
    let mut inserted = 0u64;
    let header = format!(
        "INSERT INTO {} ({}) ",
        plan.table,
        plan.column_names().join(", ")
    );
    for chunk in rows.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(header.as_str());
        builder.push_values(chunk.iter().cloned(), |mut b, row| {
            for value in row {
                push_value(&mut b, value);
            }
        });
        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting batch into {}", plan.table))?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub detailed: u64,
    pub season: u64,
    pub team: u64,
    /// Tables whose insert was skipped after planning.
    pub skipped: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Skipped,
    Loaded(LoadCounts),
    Failed(String),
}

impl LoadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, LoadOutcome::Failed(_))
    }
}

async fn close(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        warn!(error = %err, "closing database connection failed");
    }
}

/// Drop and recreate the core tables and load everything in one transaction.
pub async fn load_replace(
    db: Database,
    frame: &DerivedFrame,
    season: &SummaryTable,
    team: &SummaryTable,
) -> LoadOutcome {
    let Database::Connected(mut conn) = db else {
        warn!("no database connection; skipping load");
        return LoadOutcome::Skipped;
    };
    let result = replace_in_transaction(&mut conn, frame, season, team).await;
    close(conn).await;
    finish(result)
}

/// Create missing advanced tables, truncate, and insert the columns each live
/// table actually has, in one transaction.
pub async fn load_adaptive(
    db: Database,
    frame: &DerivedFrame,
    season: &SummaryTable,
    team: &SummaryTable,
) -> LoadOutcome {
    let Database::Connected(mut conn) = db else {
        warn!("no database connection; skipping load");
        return LoadOutcome::Skipped;
    };
    let result = adaptive_in_transaction(&mut conn, frame, season, team).await;
    close(conn).await;
    finish(result)
}

fn finish(result: anyhow::Result<LoadCounts>) -> LoadOutcome {
    match result {
        Ok(counts) => {
            info!(
                detailed = counts.detailed,
                season = counts.season,
                team = counts.team,
                "database load committed"
            );
            LoadOutcome::Loaded(counts)
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(error = %message, "database load rolled back");
            LoadOutcome::Failed(message)
        }
    }
}

async fn replace_in_transaction(
    conn: &mut PgConnection,
    frame: &DerivedFrame,
    season: &SummaryTable,
    team: &SummaryTable,
) -> anyhow::Result<LoadCounts> {
    let mut tx = conn.begin().await.context("beginning transaction")?;
    let result = async {
        for schema in [DETAILED_TABLE, SEASON_SUMMARY_TABLE, TEAM_SUMMARY_TABLE] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", schema.name))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("dropping {}", schema.name))?;
            sqlx::query(&schema.create_sql())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("creating {}", schema.name))?;
        }

        let detailed_plan = full_plan(&DETAILED_TABLE);
        let season_plan = full_plan(&SEASON_SUMMARY_TABLE);
        let team_plan = full_plan(&TEAM_SUMMARY_TABLE);
        Ok::<_, anyhow::Error>(LoadCounts {
            detailed: insert_batched(&mut tx, &detailed_plan, record_rows(frame, &detailed_plan)).await?,
            season: insert_batched(&mut tx, &season_plan, summary_rows(season, &season_plan)).await?,
            team: insert_batched(&mut tx, &team_plan, summary_rows(team, &team_plan)).await?,
            skipped: Vec::new(),
        })
    }
    .await;

    match result {
        Ok(counts) => {
            tx.commit().await.context("committing load")?;
            Ok(counts)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn adaptive_in_transaction(
    conn: &mut PgConnection,
    frame: &DerivedFrame,
    season: &SummaryTable,
    team: &SummaryTable,
) -> anyhow::Result<LoadCounts> {
    let schemas = [ADVANCED_TABLE, ADVANCED_TEAM_SUMMARY_TABLE, ADVANCED_SEASON_SUMMARY_TABLE];
    let mut tx = conn.begin().await.context("beginning transaction")?;
    let result = async {
        let names = schemas.iter().map(|s| s.name.to_string()).collect::<Vec<_>>();
        let existing = existing_tables(&mut tx, &names).await?;
        for schema in &schemas {
            if existing.iter().any(|t| t == schema.name) {
                continue;
            }
            info!(table = schema.name, "creating missing table");
            sqlx::query(&schema.create_sql())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("creating {}", schema.name))?;
        }

        sqlx::query(&format!("TRUNCATE TABLE {}", names.join(", ")))
            .execute(&mut *tx)
            .await
            .context("truncating advanced tables")?;

        let mut counts = LoadCounts::default();

        let live = live_columns(&mut tx, ADVANCED_TABLE.name).await?;
        match plan_insert(&ADVANCED_TABLE, &live, |s| frame_provides(frame, s)) {
            Ok(plan) => counts.detailed = insert_batched(&mut tx, &plan, record_rows(frame, &plan)).await?,
            Err(skip) => {
                warn!(table = ADVANCED_TABLE.name, reason = ?skip, "skipping insert");
                counts.skipped.push(ADVANCED_TABLE.name);
            }
        }

        for (schema, table) in [
            (ADVANCED_TEAM_SUMMARY_TABLE, team),
            (ADVANCED_SEASON_SUMMARY_TABLE, season),
        ] {
            let live = live_columns(&mut tx, schema.name).await?;
            match plan_insert(&schema, &live, |s| summary_provides(table, s)) {
                Ok(plan) => {
                    let inserted = insert_batched(&mut tx, &plan, summary_rows(table, &plan)).await?;
                    match table.kind {
                        SummaryKind::Season => counts.season = inserted,
                        SummaryKind::Team => counts.team = inserted,
                    }
                }
                Err(skip) => {
                    warn!(table = schema.name, reason = ?skip, "skipping insert");
                    counts.skipped.push(schema.name);
                }
            }
        }
        Ok::<_, anyhow::Error>(counts)
    }
    .await;

    match result {
        Ok(counts) => {
            tx.commit().await.context("committing load")?;
            Ok(counts)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

pub async fn existing_tables(conn: &mut PgConnection, names: &[String]) -> anyhow::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name::text = ANY($1)",
    )
    .bind(names)
    .fetch_all(&mut *conn)
    .await
    .context("listing existing tables")
}

pub async fn live_columns(conn: &mut PgConnection, table: &str) -> anyhow::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name::text = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("introspecting columns of {table}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoops_core::{parse_game_date, InputFrame, SummaryRow};
    use std::collections::BTreeMap;

    fn live(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn team_table(columns: Vec<SummaryColumn>) -> SummaryTable {
        SummaryTable {
            kind: SummaryKind::Team,
            rows: vec![SummaryRow {
                key: "Denver Nuggets".to_string(),
                values: columns.iter().map(|_| 1.5).collect(),
            }],
            columns,
        }
    }

    fn derived_frame() -> DerivedFrame {
        let input = InputFrame::from_rows(
            ["SEASON_YEAR", "TEAM_NAME", "GAME_DATE", "WL", "PTS", "AST"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            vec![["2022-23", "Denver Nuggets", "2023-06-12", "W", "94", ""]
                .iter()
                .map(|c| c.to_string())
                .collect()],
        );
        let (columns, numeric, raws) = input.into_parts();
        let records = raws
            .into_iter()
            .map(|raw| DerivedRecord {
                game_date: parse_game_date(&raw.game_date),
                metrics: BTreeMap::from([(Metric::AstToRatio, 0.0)]),
                raw,
            })
            .collect();
        DerivedFrame {
            columns,
            numeric,
            metrics: vec![Metric::AstToRatio],
            records,
        }
    }

    #[test]
    fn create_sql_marks_keys() {
        let sql = TEAM_SUMMARY_TABLE.create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS nba_playoffs_team_summary ("));
        assert!(sql.contains("team_name VARCHAR(100) PRIMARY KEY"));
        assert!(sql.contains("created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP"));
        assert!(DETAILED_TABLE.create_sql().contains("id SERIAL PRIMARY KEY"));
    }

    #[test]
    fn plan_intersects_live_and_available_columns() {
        let table = team_table(vec![SummaryColumn::AvgPts, SummaryColumn::WinRate, SummaryColumn::AvgAst]);
        let live_cols = live(&["team_name", "avg_pts", "win_rate", "avg_off_efficiency", "created_at"]);
        let plan = plan_insert(&ADVANCED_TEAM_SUMMARY_TABLE, &live_cols, |s| summary_provides(&table, s))
            .expect("plan");
        assert_eq!(plan.column_names(), vec!["team_name", "avg_pts", "win_rate"]);

        let rows = summary_rows(&table, &plan);
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Text("Denver Nuggets".to_string()),
                SqlValue::Float(Some(1.5)),
                SqlValue::Float(Some(1.5)),
            ]]
        );
    }

    #[test]
    fn plan_skips_table_without_key_column() {
        let table = team_table(vec![SummaryColumn::AvgPts]);
        let skip = plan_insert(&ADVANCED_TEAM_SUMMARY_TABLE, &live(&["avg_pts", "win_rate"]), |s| {
            summary_provides(&table, s)
        })
        .unwrap_err();
        assert_eq!(skip, PlanSkip::MissingKeyColumn("team_name"));
    }

    #[test]
    fn plan_skips_table_without_value_overlap() {
        let table = team_table(vec![SummaryColumn::AvgPts]);
        let skip = plan_insert(&ADVANCED_TEAM_SUMMARY_TABLE, &live(&["team_name", "pts", "ast"]), |s| {
            summary_provides(&table, s)
        })
        .unwrap_err();
        assert_eq!(skip, PlanSkip::NoOverlap);
    }

    #[test]
    fn record_rows_zero_fill_present_columns_and_null_absent_ones() {
        let frame = derived_frame();
        let live_cols = ADVANCED_TABLE
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let plan = plan_insert(&ADVANCED_TABLE, &live_cols, |s| frame_provides(&frame, s)).expect("plan");
        assert_eq!(
            plan.column_names(),
            vec!["season_year", "team_name", "game_date", "wl", "pts", "ast", "ast_to_ratio"]
        );

        let rows = record_rows(&frame, &plan);
        assert_eq!(rows[0][2], SqlValue::Date(NaiveDate::from_ymd_opt(2023, 6, 12)));
        assert_eq!(rows[0][4], SqlValue::Float(Some(94.0)));
        assert_eq!(rows[0][5], SqlValue::Float(Some(0.0)));

        let full = full_plan(&DETAILED_TABLE);
        let full_rows = record_rows(&frame, &full);
        let fg3m = full.column_names().iter().position(|c| *c == "fg3m").expect("fg3m");
        assert_eq!(full_rows[0][fg3m], SqlValue::Float(None));
        let team_id = full.column_names().iter().position(|c| *c == "team_id").expect("team_id");
        assert_eq!(full_rows[0][team_id], SqlValue::BigInt(None));
    }

    #[tokio::test]
    async fn disconnected_database_skips_load() {
        let db = Database::connect(None).await;
        assert!(!db.is_connected());
        let frame = derived_frame();
        let table = team_table(vec![SummaryColumn::AvgPts]);
        let outcome = load_replace(db, &frame, &table, &table).await;
        assert_eq!(outcome, LoadOutcome::Skipped);
        assert!(!outcome.is_failure());
    }

    async fn test_connection() -> Option<PgConnection> {
        let url = std::env::var("HOOPS_TEST_DATABASE_URL").ok()?;
        Some(PgConnection::connect(&url).await.expect("connect to test database"))
    }

    #[tokio::test]
    #[ignore = "requires HOOPS_TEST_DATABASE_URL"]
    async fn replace_then_adaptive_load_round_trip() {
        if std::env::var("HOOPS_TEST_DATABASE_URL").is_err() {
            return;
        }
        let frame = derived_frame();
        let season = SummaryTable {
            kind: SummaryKind::Season,
            columns: vec![SummaryColumn::AvgPts, SummaryColumn::AvgFg3m],
            rows: vec![SummaryRow {
                key: "2022-23".to_string(),
                values: vec![94.0, 0.0],
            }],
        };
        let team = team_table(vec![SummaryColumn::AvgPts, SummaryColumn::WinRate]);

        for _ in 0..2 {
            let conn = test_connection().await.expect("connection");
            let outcome = load_replace(Database::Connected(conn), &frame, &season, &team).await;
            match outcome {
                LoadOutcome::Loaded(counts) => {
                    assert_eq!((counts.detailed, counts.season, counts.team), (1, 1, 1))
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            let mut conn = test_connection().await.expect("count connection");
            for table in [DETAILED_TABLE, SEASON_SUMMARY_TABLE, TEAM_SUMMARY_TABLE] {
                let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name))
                    .fetch_one(&mut conn)
                    .await
                    .expect("count rows");
                assert_eq!(rows, 1, "{} after reload", table.name);
            }
            conn.close().await.expect("close");
        }

        let conn = test_connection().await.expect("second connection");
        let outcome = load_adaptive(Database::Connected(conn), &frame, &season, &team).await;
        match outcome {
            LoadOutcome::Loaded(counts) => {
                assert_eq!(counts.detailed, 1);
                assert_eq!(counts.team, 1);
                assert_eq!(counts.season, 1);
                assert!(counts.skipped.is_empty());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

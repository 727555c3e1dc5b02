//! Core domain model, CSV frame IO and settings for the playoffs ETL.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hoops-core";

/// Source dataset column names.
pub mod columns {
    pub const SEASON_YEAR: &str = "SEASON_YEAR";
    pub const TEAM_ID: &str = "TEAM_ID";
    pub const TEAM_NAME: &str = "TEAM_NAME";
    pub const GAME_DATE: &str = "GAME_DATE";
    pub const MATCHUP: &str = "MATCHUP";
    pub const WL: &str = "WL";
    pub const PTS: &str = "PTS";
    pub const FGA: &str = "FGA";
    pub const FGM: &str = "FGM";
    pub const FG_PCT: &str = "FG_PCT";
    pub const FG3M: &str = "FG3M";
    pub const FG3_PCT: &str = "FG3_PCT";
    pub const FTA: &str = "FTA";
    pub const FTM: &str = "FTM";
    pub const OREB: &str = "OREB";
    pub const REB: &str = "REB";
    pub const AST: &str = "AST";
    pub const STL: &str = "STL";
    pub const BLK: &str = "BLK";
    pub const TOV: &str = "TOV";
    pub const PLUS_MINUS: &str = "PLUS_MINUS";
    pub const MIN: &str = "MIN";
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("reading csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("no input file found: {0}")]
    InputNotFound(String),
    #[error("unparseable game date {value:?} in row {row}")]
    InvalidDate { row: usize, value: String },
    #[error("aggregate input column {0} is not available")]
    MissingAggregateInput(String),
    #[error("parsing settings {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One row of the source dataset. Identity fields are typed; every cell of the
/// source row is kept so detailed outputs can carry all raw fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub season_year: String,
    pub team_id: Option<i64>,
    pub team_name: String,
    pub game_date: String,
    pub matchup: String,
    pub wl: String,
    stats: BTreeMap<String, Option<f64>>,
    cells: Vec<String>,
}

impl RawRecord {
    /// Numeric value of `column`; `None` when the column is absent, non-numeric or empty.
    pub fn stat(&self, column: &str) -> Option<f64> {
        self.stats.get(column).copied().flatten()
    }

    /// Numeric value with missing cells filled with zero.
    pub fn stat_or_zero(&self, column: &str) -> f64 {
        self.stat(column).unwrap_or(0.0)
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn is_win(&self) -> bool {
        self.wl.trim() == "W"
    }
}

/// Header + raw records as read from an input CSV.
#[derive(Debug, Clone, Default)]
pub struct InputFrame {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    numeric: BTreeSet<String>,
    records: Vec<RawRecord>,
}

impl InputFrame {
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let csv_err = |source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;
        let columns = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(csv_err)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self::from_rows(columns, rows))
    }

    /// A column is numeric when it has at least one present cell and every
    /// present cell parses as a number.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut cells| {
                cells.resize(width, String::new());
                cells
            })
            .collect::<Vec<_>>();

        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect::<HashMap<_, _>>();

        let numeric = columns
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let mut present = rows
                    .iter()
                    .map(|r| r[*i].trim())
                    .filter(|cell| !is_missing_cell(cell))
                    .peekable();
                present.peek().is_some() && present.all(|cell| cell.parse::<f64>().is_ok())
            })
            .map(|(_, c)| c.clone())
            .collect::<BTreeSet<_>>();

        let text = |cells: &[String], column: &str| -> String {
            index
                .get(column)
                .map(|i| cells[*i].trim().to_string())
                .unwrap_or_default()
        };

        let records = rows
            .into_iter()
            .map(|cells| {
                let stats = numeric
                    .iter()
                    .map(|c| {
                        let cell = cells[index[c]].trim();
                        let value = if is_missing_cell(cell) {
                            None
                        } else {
                            cell.parse::<f64>().ok()
                        };
                        (c.clone(), value)
                    })
                    .collect();
                RawRecord {
                    season_year: text(&cells, columns::SEASON_YEAR),
                    team_id: text(&cells, columns::TEAM_ID)
                        .parse::<f64>()
                        .ok()
                        .map(|v| v as i64),
                    team_name: text(&cells, columns::TEAM_NAME),
                    game_date: text(&cells, columns::GAME_DATE),
                    matchup: text(&cells, columns::MATCHUP),
                    wl: text(&cells, columns::WL),
                    stats,
                    cells,
                }
            })
            .collect();

        Self {
            columns,
            index,
            numeric,
            records,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn is_numeric(&self, column: &str) -> bool {
        self.numeric.contains(column)
    }

    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.has_column(c))
            .map(|c| c.to_string())
            .collect()
    }

    pub fn require_columns(&self, required: &[&str]) -> Result<(), PipelineError> {
        let missing = self.missing_columns(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingColumns(missing))
        }
    }

    pub fn distinct_count(&self, column: &str) -> usize {
        let Some(i) = self.index.get(column) else {
            return 0;
        };
        self.records
            .iter()
            .map(|r| r.cells[*i].trim())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn into_parts(self) -> (Vec<String>, BTreeSet<String>, Vec<RawRecord>) {
        (self.columns, self.numeric, self.records)
    }
}

/// Computed per-record metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    OffensiveEfficiency,
    DefensiveRating,
    PlusMinusPerMin,
    AstToRatio,
    PlayoffEfficiency,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::OffensiveEfficiency,
        Metric::DefensiveRating,
        Metric::PlusMinusPerMin,
        Metric::AstToRatio,
        Metric::PlayoffEfficiency,
    ];

    /// Upper-case name used in CSV outputs.
    pub fn column_name(self) -> &'static str {
        match self {
            Metric::OffensiveEfficiency => "OFFENSIVE_EFFICIENCY",
            Metric::DefensiveRating => "DEFENSIVE_RATING",
            Metric::PlusMinusPerMin => "PLUS_MINUS_PER_MIN",
            Metric::AstToRatio => "AST_TO_RATIO",
            Metric::PlayoffEfficiency => "PLAYOFF_EFFICIENCY",
        }
    }

    pub fn db_column(self) -> &'static str {
        match self {
            Metric::OffensiveEfficiency => "offensive_efficiency",
            Metric::DefensiveRating => "defensive_rating",
            Metric::PlusMinusPerMin => "plus_minus_per_min",
            Metric::AstToRatio => "ast_to_ratio",
            Metric::PlayoffEfficiency => "playoff_efficiency",
        }
    }

    pub fn from_column_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.column_name() == name)
    }
}

/// A raw record plus its parsed date and computed metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRecord {
    pub raw: RawRecord,
    pub game_date: Option<NaiveDate>,
    pub metrics: BTreeMap<Metric, f64>,
}

impl DerivedRecord {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(&metric).copied()
    }

    /// Value of an input column or a computed metric column.
    pub fn value(&self, column: &str) -> Option<f64> {
        Metric::from_column_name(column)
            .and_then(|m| self.metric(m))
            .or_else(|| self.raw.stat(column))
    }
}

/// The full derived record set of one run.
#[derive(Debug, Clone, Default)]
pub struct DerivedFrame {
    pub columns: Vec<String>,
    pub numeric: BTreeSet<String>,
    pub metrics: Vec<Metric>,
    pub records: Vec<DerivedRecord>,
}

impl DerivedFrame {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
            || self.metrics.iter().any(|m| m.column_name() == column)
    }

    pub fn has_metric(&self, metric: Metric) -> bool {
        self.metrics.contains(&metric)
    }

    /// Raw columns (minus those replaced by computed metrics) followed by metric columns.
    pub fn output_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !self.metrics.iter().any(|m| m.column_name() == c.as_str()))
            .cloned()
            .chain(self.metrics.iter().map(|m| m.column_name().to_string()))
            .collect()
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        let csv_err = |source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        writer.write_record(self.output_columns()).map_err(csv_err)?;

        for record in &self.records {
            let mut row = Vec::with_capacity(self.columns.len() + self.metrics.len());
            for (i, column) in self.columns.iter().enumerate() {
                if self.metrics.iter().any(|m| m.column_name() == column.as_str()) {
                    continue;
                }
                let cell = record.raw.cells[i].trim();
                if column == columns::GAME_DATE {
                    match record.game_date {
                        Some(date) => row.push(date.format("%Y-%m-%d").to_string()),
                        None => row.push(cell.to_string()),
                    }
                } else if self.numeric.contains(column) && is_missing_cell(cell) {
                    row.push("0".to_string());
                } else {
                    row.push(cell.to_string());
                }
            }
            for metric in &self.metrics {
                row.push(
                    record
                        .metric(*metric)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            writer.write_record(&row).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryKind {
    Season,
    Team,
}

impl SummaryKind {
    /// Input column the summary is grouped by.
    pub fn source_column(self) -> &'static str {
        match self {
            SummaryKind::Season => columns::SEASON_YEAR,
            SummaryKind::Team => columns::TEAM_NAME,
        }
    }

    /// Output (CSV + DB) name of the grouping key.
    pub fn key_column(self) -> &'static str {
        match self {
            SummaryKind::Season => "season_year",
            SummaryKind::Team => "team_name",
        }
    }

    pub fn key_of(self, record: &RawRecord) -> &str {
        match self {
            SummaryKind::Season => &record.season_year,
            SummaryKind::Team => &record.team_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Mean(&'static str),
    WinRate,
}

/// Every aggregate column the pipeline knows how to compute and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SummaryColumn {
    AvgPts,
    AvgFg3m,
    AvgAst,
    AvgReb,
    AvgFgPct,
    AvgFg3Pct,
    WinRate,
    AvgOffEfficiency,
    AvgDefRating,
    AvgPlayoffEfficiency,
}

impl SummaryColumn {
    pub const ALL: [SummaryColumn; 10] = [
        SummaryColumn::AvgPts,
        SummaryColumn::AvgFg3m,
        SummaryColumn::AvgAst,
        SummaryColumn::AvgReb,
        SummaryColumn::AvgFgPct,
        SummaryColumn::AvgFg3Pct,
        SummaryColumn::WinRate,
        SummaryColumn::AvgOffEfficiency,
        SummaryColumn::AvgDefRating,
        SummaryColumn::AvgPlayoffEfficiency,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SummaryColumn::AvgPts => "avg_pts",
            SummaryColumn::AvgFg3m => "avg_fg3m",
            SummaryColumn::AvgAst => "avg_ast",
            SummaryColumn::AvgReb => "avg_reb",
            SummaryColumn::AvgFgPct => "avg_fg_pct",
            SummaryColumn::AvgFg3Pct => "avg_fg3_pct",
            SummaryColumn::WinRate => "win_rate",
            SummaryColumn::AvgOffEfficiency => "avg_off_efficiency",
            SummaryColumn::AvgDefRating => "avg_def_rating",
            SummaryColumn::AvgPlayoffEfficiency => "avg_playoff_efficiency",
        }
    }

    pub fn source(self) -> SummarySource {
        match self {
            SummaryColumn::AvgPts => SummarySource::Mean(columns::PTS),
            SummaryColumn::AvgFg3m => SummarySource::Mean(columns::FG3M),
            SummaryColumn::AvgAst => SummarySource::Mean(columns::AST),
            SummaryColumn::AvgReb => SummarySource::Mean(columns::REB),
            SummaryColumn::AvgFgPct => SummarySource::Mean(columns::FG_PCT),
            SummaryColumn::AvgFg3Pct => SummarySource::Mean(columns::FG3_PCT),
            SummaryColumn::WinRate => SummarySource::WinRate,
            SummaryColumn::AvgOffEfficiency => {
                SummarySource::Mean(Metric::OffensiveEfficiency.column_name())
            }
            SummaryColumn::AvgDefRating => SummarySource::Mean(Metric::DefensiveRating.column_name()),
            SummaryColumn::AvgPlayoffEfficiency => {
                SummarySource::Mean(Metric::PlayoffEfficiency.column_name())
            }
        }
    }

    /// Input or metric column this aggregate reads.
    pub fn input_column(self) -> &'static str {
        match self.source() {
            SummarySource::Mean(column) => column,
            SummarySource::WinRate => columns::WL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub key: String,
    pub values: Vec<f64>,
}

/// Season or team aggregate: one row per distinct key, one value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTable {
    pub kind: SummaryKind,
    pub columns: Vec<SummaryColumn>,
    pub rows: Vec<SummaryRow>,
}

impl SummaryTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value(&self, key: &str, column: SummaryColumn) -> Option<f64> {
        let idx = self.columns.iter().position(|c| *c == column)?;
        self.rows
            .iter()
            .find(|r| r.key == key)
            .and_then(|r| r.values.get(idx).copied())
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        let csv_err = |source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
        let header = std::iter::once(self.kind.key_column())
            .chain(self.columns.iter().map(|c| c.name()))
            .collect::<Vec<_>>();
        writer.write_record(&header).map_err(csv_err)?;
        for row in &self.rows {
            let cells = std::iter::once(row.key.clone())
                .chain(row.values.iter().map(|v| {
                    if v.is_finite() {
                        v.to_string()
                    } else {
                        String::new()
                    }
                }))
                .collect::<Vec<_>>();
            writer.write_record(&cells).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Cell text read as a missing value: blank or one of the usual NA spellings.
pub fn is_missing_cell(cell: &str) -> bool {
    const NA_TOKENS: [&str; 11] = [
        "NA", "N/A", "n/a", "#N/A", "NaN", "nan", "-nan", "NULL", "null", "None", "<NA>",
    ];
    let cell = cell.trim();
    cell.is_empty() || NA_TOKENS.contains(&cell)
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Parse an ISO date, ISO datetime or US `m/d/Y` date.
pub fn parse_game_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.date());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Connection parameters for the relational store.
#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub repo_url: String,
    pub branch: String,
    pub file_name: String,
    pub pattern: String,
    pub keyword: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            repo_url: "https://github.com/NocturneBear/NBA-Data-2010-2024".to_string(),
            branch: "main".to_string(),
            file_name: "play_off_totals_2010_2024.csv".to_string(),
            pattern: "*.csv".to_string(),
            keyword: "play_off".to_string(),
        }
    }
}

impl SourceSettings {
    /// Web URL of the known dataset file inside the source repository.
    pub fn file_url(&self) -> String {
        format!(
            "{}/blob/{}/{}",
            self.repo_url.trim_end_matches('/'),
            self.branch,
            self.file_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub staging_dir: PathBuf,
    pub canonical_file: PathBuf,
    pub processed_dir: PathBuf,
    pub advanced_output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub search_root: PathBuf,
    pub temp_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("data/staging"),
            canonical_file: PathBuf::from("data/play_off_totals_2010_2024.csv"),
            processed_dir: PathBuf::from("data/processed_data"),
            advanced_output_dir: PathBuf::from("processed_data"),
            log_dir: PathBuf::from("logs"),
            search_root: PathBuf::from("."),
            temp_dir: PathBuf::from("temp_repo"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 5432,
            database: "nba_playoffs".to_string(),
            user: "postgres".to_string(),
            password: None,
        }
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("enabled", &self.enabled)
            .field("target", &self.to_config())
            .finish()
    }
}

impl DatabaseSettings {
    pub fn to_config(&self) -> Option<DbConfig> {
        if !self.enabled {
            return None;
        }
        Some(DbConfig {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationSettings {
    pub schedule_time: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            schedule_time: "02:00".to_string(),
            max_retries: 3,
            retry_delay_secs: 300,
            poll_interval_secs: 60,
            error_backoff_secs: 300,
        }
    }
}

/// Everything the pipeline stages can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: SourceSettings,
    pub paths: PathSettings,
    pub database: DatabaseSettings,
    pub automation: AutomationSettings,
}

impl Settings {
    /// Defaults, overlaid with the YAML file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| PipelineError::Settings {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn frame(columns: &[&str], rows: &[&[&str]]) -> InputFrame {
        InputFrame::from_rows(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn numeric_columns_tolerate_empty_cells() {
        let f = frame(
            &["TEAM_NAME", "PTS", "OREB"],
            &[&["Boston Celtics", "110", ""], &["Miami Heat", "98", "12"]],
        );
        assert!(f.is_numeric("PTS"));
        assert!(f.is_numeric("OREB"));
        assert!(!f.is_numeric("TEAM_NAME"));
        assert_eq!(f.records()[0].stat("OREB"), None);
        assert_eq!(f.records()[0].stat_or_zero("OREB"), 0.0);
        assert_eq!(f.records()[1].stat("OREB"), Some(12.0));
    }

    #[test]
    fn na_tokens_are_missing_and_keep_columns_numeric() {
        let f = frame(
            &["TEAM_NAME", "PTS", "AST"],
            &[&["Boston Celtics", "N/A", "25"], &["Miami Heat", "98", "NaN"]],
        );
        assert!(f.is_numeric("PTS"));
        assert!(f.is_numeric("AST"));
        assert_eq!(f.records()[0].stat("PTS"), None);
        assert_eq!(f.records()[1].stat("AST"), None);
        assert_eq!(f.records()[1].stat("PTS"), Some(98.0));
    }

    #[test]
    fn empty_frame_has_no_numeric_columns() {
        let f = frame(&["TEAM_NAME", "PTS"], &[]);
        assert!(!f.is_numeric("TEAM_NAME"));
        assert!(!f.is_numeric("PTS"));

        let blank = frame(&["TEAM_NAME", "OREB"], &[&["Denver Nuggets", ""]]);
        assert!(!blank.is_numeric("OREB"));
    }

    #[test]
    fn short_rows_are_padded() {
        let f = frame(&["SEASON_YEAR", "TEAM_NAME", "WL"], &[&["2023-24", "Denver Nuggets"]]);
        assert_eq!(f.records()[0].cells().len(), 3);
        assert_eq!(f.records()[0].wl, "");
        assert!(!f.records()[0].is_win());
    }

    #[test]
    fn missing_columns_are_reported() {
        let f = frame(&["SEASON_YEAR", "PTS"], &[]);
        let err = f
            .require_columns(&[columns::SEASON_YEAR, columns::TEAM_NAME, columns::WL])
            .unwrap_err();
        match err {
            PipelineError::MissingColumns(missing) => {
                assert_eq!(missing, vec!["TEAM_NAME".to_string(), "WL".to_string()])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn game_dates_parse_in_common_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 4, 20).unwrap();
        assert_eq!(parse_game_date("2024-04-20"), Some(expected));
        assert_eq!(parse_game_date("2024-04-20T00:00:00"), Some(expected));
        assert_eq!(parse_game_date("2024-04-20 00:00:00"), Some(expected));
        assert_eq!(parse_game_date("04/20/2024"), Some(expected));
        assert_eq!(parse_game_date("not a date"), None);
        assert_eq!(parse_game_date(""), None);
    }

    #[test]
    fn rounding_matches_decimal_places() {
        assert_eq!(round_to(1.23456, 3), 1.235);
        assert_eq!(round_to(2.0 / 3.0, 2), 0.67);
    }

    #[test]
    fn derived_csv_replaces_stale_metric_columns() {
        let f = frame(
            &["SEASON_YEAR", "GAME_DATE", "PTS", "OFFENSIVE_EFFICIENCY"],
            &[&["2023-24", "2024-04-20T00:00:00", "", "9.9"]],
        );
        let (columns, numeric, records) = f.into_parts();
        let record = records.into_iter().next().unwrap();
        let derived = DerivedFrame {
            columns,
            numeric,
            metrics: vec![Metric::OffensiveEfficiency],
            records: vec![DerivedRecord {
                game_date: parse_game_date(&record.game_date),
                metrics: BTreeMap::from([(Metric::OffensiveEfficiency, 1.25)]),
                raw: record,
            }],
        };
        assert_eq!(
            derived.output_columns(),
            vec!["SEASON_YEAR", "GAME_DATE", "PTS", "OFFENSIVE_EFFICIENCY"]
        );

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("detailed.csv");
        derived.write_csv(&path).expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "SEASON_YEAR,GAME_DATE,PTS,OFFENSIVE_EFFICIENCY\n2023-24,2024-04-20,0,1.25\n"
        );
    }

    #[test]
    fn settings_yaml_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("hoops.yaml");
        std::fs::write(
            &path,
            "paths:\n  staging_dir: /tmp/staging\ndatabase:\n  enabled: false\nautomation:\n  max_retries: 5\n",
        )
        .expect("write yaml");

        let settings = Settings::load(Some(&path)).expect("load");
        assert_eq!(settings.paths.staging_dir, PathBuf::from("/tmp/staging"));
        assert_eq!(settings.paths.log_dir, PathBuf::from("logs"));
        assert_eq!(settings.automation.max_retries, 5);
        assert_eq!(settings.automation.schedule_time, "02:00");
        assert!(settings.database.to_config().is_none());
        assert_eq!(
            settings.source.file_url(),
            "https://github.com/NocturneBear/NBA-Data-2010-2024/blob/main/play_off_totals_2010_2024.csv"
        );
    }

    #[test]
    fn db_config_debug_redacts_password() {
        let config = DbConfig {
            host: "db".into(),
            port: 5432,
            database: "nba_playoffs".into(),
            user: "etl".into(),
            password: Some("hunter2".into()),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(config.to_string(), "etl@db:5432/nba_playoffs");
    }
}

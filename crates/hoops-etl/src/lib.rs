//! Core and advanced transform/load pipelines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use hoops_core::{
    columns, parse_game_date, round_to, DbConfig, DerivedFrame, DerivedRecord, InputFrame, Metric,
    PipelineError, RawRecord, Settings, SummaryColumn, SummaryKind, SummaryRow, SummaryTable,
};
use hoops_db::{load_adaptive, load_replace, Database, LoadOutcome};
use hoops_storage::{
    csv_files_in, file_stamp, find_data_files, name_contains_keyword, select_primary, write_atomic,
    write_run_marker, StagingStore,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hoops-etl";

pub const CORE_REQUIRED_COLUMNS: [&str; 7] = [
    columns::SEASON_YEAR,
    columns::TEAM_NAME,
    columns::GAME_DATE,
    columns::PTS,
    columns::FG3M,
    columns::AST,
    columns::WL,
];

pub const ADVANCED_REQUIRED_COLUMNS: [&str; 4] = [
    columns::SEASON_YEAR,
    columns::TEAM_NAME,
    columns::PTS,
    columns::WL,
];

/// Columns the primary core formula set reads; any absence selects the fallback.
pub const PRIMARY_FORMULA_COLUMNS: [&str; 6] = [
    columns::FGA,
    columns::OREB,
    columns::TOV,
    columns::STL,
    columns::BLK,
    columns::PLUS_MINUS,
];

pub const DEFAULT_MINUTES: f64 = 30.0;

pub const CORE_SEASON_COLUMNS: [SummaryColumn; 5] = [
    SummaryColumn::AvgPts,
    SummaryColumn::AvgFg3m,
    SummaryColumn::AvgAst,
    SummaryColumn::AvgOffEfficiency,
    SummaryColumn::AvgDefRating,
];

pub const CORE_TEAM_COLUMNS: [SummaryColumn; 4] = [
    SummaryColumn::AvgPts,
    SummaryColumn::WinRate,
    SummaryColumn::AvgOffEfficiency,
    SummaryColumn::AvgDefRating,
];

pub const EXTRA_SUMMARY_COLUMNS: [SummaryColumn; 4] = [
    SummaryColumn::AvgReb,
    SummaryColumn::AvgFgPct,
    SummaryColumn::AvgFg3Pct,
    SummaryColumn::AvgPlayoffEfficiency,
];

pub const MINIMAL_SUMMARY_COLUMNS: [SummaryColumn; 2] = [SummaryColumn::AvgPts, SummaryColumn::WinRate];

pub const DETAILED_OUTPUT: &str = "playoffs_detailed";
pub const ADVANCED_OUTPUT: &str = "playoffs_advanced";
pub const SEASON_OUTPUT: &str = "season_summary";
pub const TEAM_OUTPUT: &str = "team_summary";

// Input resolution

/// Newest snapshot's CSV carrying `keyword`, else its first CSV.
fn snapshot_input(staging_dir: &Path, keyword: &str) -> Option<PathBuf> {
    let store = StagingStore::new(staging_dir);
    let latest = match store.latest_snapshot() {
        Ok(latest) => latest?,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "listing staging snapshots failed");
            return None;
        }
    };
    let files = match csv_files_in(&latest) {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "listing snapshot files failed");
            return None;
        }
    };
    if files.is_empty() {
        warn!(snapshot = %latest.display(), "latest snapshot holds no csv files");
    }
    select_primary(&files, keyword).cloned()
}

/// Explicit path, then the newest staging snapshot, then the canonical file.
pub fn resolve_core_input(
    explicit: Option<&Path>,
    staging_dir: &Path,
    keyword: &str,
    canonical_file: &Path,
) -> Result<PathBuf, PipelineError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = snapshot_input(staging_dir, keyword) {
        return Ok(path);
    }
    if canonical_file.is_file() {
        return Ok(canonical_file.to_path_buf());
    }
    Err(PipelineError::InputNotFound(format!(
        "no staging snapshot under {} and no file at {}",
        staging_dir.display(),
        canonical_file.display()
    )))
}

#[derive(Debug, Clone)]
pub struct AdvancedInputSearch<'a> {
    pub canonical_file: &'a Path,
    pub processed_dir: &'a Path,
    pub staging_dir: &'a Path,
    pub search_root: &'a Path,
    pub keyword: &'a str,
}

impl AdvancedInputSearch<'_> {
    /// Well-known locations in priority order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![
            self.canonical_file.to_path_buf(),
            self.search_root.join("play_off_totals_2010_2024.csv"),
            self.search_root.join("playoffs_detailed.csv"),
            self.search_root.join("playoffs_detailed_processed.csv"),
            self.processed_dir.join("playoffs_detailed.csv"),
        ];
        let store = StagingStore::new(self.staging_dir);
        if let Ok(Some(latest)) = store.latest_snapshot() {
            if let Ok(files) = csv_files_in(&latest) {
                candidates.extend(
                    files
                        .into_iter()
                        .filter(|f| name_contains_keyword(f, self.keyword)),
                );
            }
        }
        candidates
    }
}

/// Explicit path, then well-known locations, then a recursive search.
pub fn resolve_advanced_input(
    explicit: Option<&Path>,
    search: &AdvancedInputSearch<'_>,
) -> Result<PathBuf, PipelineError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(found) = search.candidates().into_iter().find(|p| p.is_file()) {
        info!(path = %found.display(), "input file found");
        return Ok(found);
    }

    warn!(root = %search.search_root.display(), "no input at standard locations; searching recursively");
    let files = find_data_files(search.search_root, "*.csv")
        .map_err(|err| PipelineError::InputNotFound(format!("{err:#}")))?;
    select_primary(&files, search.keyword)
        .cloned()
        .ok_or_else(|| {
            PipelineError::InputNotFound(format!(
                "no csv file under {}",
                search.search_root.display()
            ))
        })
}

// Metrics

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreFormula {
    Primary,
    Fallback,
}

impl CoreFormula {
    pub fn for_frame(frame: &InputFrame) -> Self {
        if frame.missing_columns(&PRIMARY_FORMULA_COLUMNS).is_empty() {
            CoreFormula::Primary
        } else {
            CoreFormula::Fallback
        }
    }
}

fn minutes(record: &RawRecord, minutes_numeric: bool) -> f64 {
    if minutes_numeric {
        record.stat_or_zero(columns::MIN)
    } else {
        DEFAULT_MINUTES
    }
}

fn offensive_efficiency(record: &RawRecord) -> f64 {
    let possessions = record.stat_or_zero(columns::FGA) - record.stat_or_zero(columns::OREB)
        + record.stat_or_zero(columns::TOV);
    record.stat_or_zero(columns::PTS) / possessions.max(1.0)
}

fn defensive_rating(record: &RawRecord) -> f64 {
    (record.stat_or_zero(columns::STL) + record.stat_or_zero(columns::BLK))
        / record.stat_or_zero(columns::TOV).max(1.0)
}

fn plus_minus_per_min(record: &RawRecord, minutes_numeric: bool) -> f64 {
    record.stat_or_zero(columns::PLUS_MINUS) / minutes(record, minutes_numeric).max(1.0)
}

fn ast_to_ratio(record: &RawRecord) -> f64 {
    record.stat_or_zero(columns::AST) / record.stat_or_zero(columns::TOV).max(1.0)
}

fn playoff_efficiency(record: &RawRecord) -> f64 {
    let s = |c| record.stat_or_zero(c);
    (s(columns::PTS) + s(columns::REB) + s(columns::AST) + s(columns::STL) + s(columns::BLK))
        - ((s(columns::FGA) - s(columns::FGM)) + (s(columns::FTA) - s(columns::FTM)) + s(columns::TOV))
}

pub const CORE_METRICS: [Metric; 4] = [
    Metric::OffensiveEfficiency,
    Metric::DefensiveRating,
    Metric::PlusMinusPerMin,
    Metric::AstToRatio,
];

/// The four core metrics for one record, rounded to 3 decimals.
pub fn core_metrics(
    record: &RawRecord,
    formula: CoreFormula,
    minutes_numeric: bool,
) -> BTreeMap<Metric, f64> {
    let values = match formula {
        CoreFormula::Primary => [
            offensive_efficiency(record),
            defensive_rating(record),
            plus_minus_per_min(record, minutes_numeric),
            ast_to_ratio(record),
        ],
        CoreFormula::Fallback => [
            record.stat_or_zero(columns::PTS) / record.stat_or_zero(columns::FGA).max(1.0),
            0.0,
            0.0,
            0.0,
        ],
    };
    CORE_METRICS
        .into_iter()
        .zip(values)
        .map(|(m, v)| (m, round_to(v, 3)))
        .collect()
}

/// Input columns a metric needs in the advanced transformer.
pub fn metric_inputs(metric: Metric) -> &'static [&'static str] {
    match metric {
        Metric::OffensiveEfficiency => &[columns::PTS, columns::FGA, columns::OREB, columns::TOV],
        Metric::DefensiveRating => &[columns::STL, columns::BLK, columns::TOV],
        Metric::PlusMinusPerMin => &[columns::PLUS_MINUS],
        Metric::AstToRatio => &[columns::AST, columns::TOV],
        Metric::PlayoffEfficiency => &[
            columns::PTS,
            columns::REB,
            columns::AST,
            columns::STL,
            columns::BLK,
            columns::FGM,
            columns::FGA,
            columns::FTM,
            columns::FTA,
            columns::TOV,
        ],
    }
}

/// Metrics whose every input column is present.
pub fn available_metrics(frame: &InputFrame) -> Vec<Metric> {
    Metric::ALL
        .into_iter()
        .filter(|m| frame.missing_columns(metric_inputs(*m)).is_empty())
        .collect()
}

pub fn advanced_metrics(
    record: &RawRecord,
    metrics: &[Metric],
    minutes_numeric: bool,
) -> BTreeMap<Metric, f64> {
    metrics
        .iter()
        .map(|metric| {
            let value = match metric {
                Metric::OffensiveEfficiency => round_to(offensive_efficiency(record), 3),
                Metric::DefensiveRating => round_to(defensive_rating(record), 3),
                Metric::PlusMinusPerMin => round_to(plus_minus_per_min(record, minutes_numeric), 3),
                Metric::AstToRatio => round_to(ast_to_ratio(record), 3),
                Metric::PlayoffEfficiency => round_to(playoff_efficiency(record), 2),
            };
            (*metric, value)
        })
        .collect()
}

// Aggregation

/// Whether a summary column's input exists in `frame`.
pub fn summary_available(frame: &DerivedFrame, column: SummaryColumn) -> bool {
    frame.has_column(column.input_column())
}

/// Group by the summary key (sorted) and compute every column, rounded to
/// `decimals`. Means skip missing cells; a group with none is NaN.
pub fn aggregate(
    kind: SummaryKind,
    frame: &DerivedFrame,
    columns: &[SummaryColumn],
    decimals: u32,
) -> Result<SummaryTable, PipelineError> {
    if let Some(missing) = columns.iter().find(|c| !summary_available(frame, **c)) {
        return Err(PipelineError::MissingAggregateInput(
            missing.input_column().to_string(),
        ));
    }

    let mut groups: BTreeMap<&str, Vec<&DerivedRecord>> = BTreeMap::new();
    for record in &frame.records {
        groups.entry(kind.key_of(&record.raw)).or_default().push(record);
    }

    let rows = groups
        .into_iter()
        .map(|(key, records)| {
            let values = columns
                .iter()
                .map(|column| {
                    let mean = match column.source() {
                        hoops_core::SummarySource::Mean(input) => {
                            let present = records
                                .iter()
                                .filter_map(|r| r.value(input))
                                .collect::<Vec<_>>();
                            let skipped = records.len() - present.len();
                            if skipped > 0 {
                                warn!(
                                    key,
                                    column = input,
                                    skipped,
                                    "missing values left out of mean"
                                );
                            }
                            if present.is_empty() {
                                f64::NAN
                            } else {
                                present.iter().sum::<f64>() / present.len() as f64
                            }
                        }
                        hoops_core::SummarySource::WinRate => {
                            records.iter().filter(|r| r.raw.is_win()).count() as f64
                                / records.len() as f64
                        }
                    };
                    round_to(mean, decimals)
                })
                .collect();
            SummaryRow {
                key: key.to_string(),
                values,
            }
        })
        .collect();

    Ok(SummaryTable {
        kind,
        columns: columns.to_vec(),
        rows,
    })
}

/// Season and team column sets for the advanced transformer, or the minimal
/// pair when any core aggregate column is unavailable.
pub fn advanced_summary_columns(frame: &DerivedFrame) -> (Vec<SummaryColumn>, Vec<SummaryColumn>) {
    let mirrors_core = CORE_SEASON_COLUMNS
        .iter()
        .chain(CORE_TEAM_COLUMNS.iter())
        .all(|c| summary_available(frame, *c));
    if !mirrors_core {
        warn!("core aggregate inputs unavailable; using minimal summaries");
        return (
            MINIMAL_SUMMARY_COLUMNS.to_vec(),
            MINIMAL_SUMMARY_COLUMNS.to_vec(),
        );
    }

    let extras = EXTRA_SUMMARY_COLUMNS
        .into_iter()
        .filter(|c| summary_available(frame, *c))
        .collect::<Vec<_>>();

    let mut season = CORE_SEASON_COLUMNS.to_vec();
    season.push(SummaryColumn::WinRate);
    season.extend(extras.iter().copied());

    let mut team = CORE_TEAM_COLUMNS.to_vec();
    team.push(SummaryColumn::AvgAst);
    team.extend(extras);
    (season, team)
}

// Pipeline state

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionStats {
    pub total_rows: usize,
    pub columns: usize,
    pub seasons: usize,
    pub teams: usize,
    pub extraction_time: DateTime<Local>,
}

impl ExtractionStats {
    pub fn of(frame: &InputFrame, at: DateTime<Local>) -> Self {
        Self {
            total_rows: frame.len(),
            columns: frame.columns().len(),
            seasons: frame.distinct_count(columns::SEASON_YEAR),
            teams: frame.distinct_count(columns::TEAM_NAME),
            extraction_time: at,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "total_rows: {}\ncolumns: {}\nseasons: {}\nteams: {}\nextraction_time: {}\n",
            self.total_rows,
            self.columns,
            self.seasons,
            self.teams,
            self.extraction_time.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// A validated input file and its rows.
#[derive(Debug)]
pub struct ExtractedInput {
    pub path: PathBuf,
    pub frame: InputFrame,
    pub stats: ExtractionStats,
}

/// Derived records plus both aggregates.
#[derive(Debug)]
pub struct TransformedData {
    pub frame: DerivedFrame,
    pub season: SummaryTable,
    pub team: SummaryTable,
}

/// Paths written for one run's artifacts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputFiles {
    pub detailed: Vec<PathBuf>,
    pub season: Vec<PathBuf>,
    pub team: Vec<PathBuf>,
}

impl OutputFiles {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.detailed.iter().chain(&self.season).chain(&self.team)
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub input: PathBuf,
    pub rows: usize,
    pub outputs: OutputFiles,
    pub load: LoadOutcome,
    pub marker: PathBuf,
}

fn write_outputs(
    dir: &Path,
    detailed_name: &str,
    data: &TransformedData,
    at: DateTime<Local>,
) -> anyhow::Result<OutputFiles> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let stamp = file_stamp(at);
    let mut outputs = OutputFiles::default();
    for name in [format!("{detailed_name}_{stamp}.csv"), format!("{detailed_name}.csv")] {
        let path = dir.join(name);
        data.frame.write_csv(&path)?;
        outputs.detailed.push(path);
    }
    for name in [format!("{SEASON_OUTPUT}_{stamp}.csv"), format!("{SEASON_OUTPUT}.csv")] {
        let path = dir.join(name);
        data.season.write_csv(&path)?;
        outputs.season.push(path);
    }
    for name in [format!("{TEAM_OUTPUT}_{stamp}.csv"), format!("{TEAM_OUTPUT}.csv")] {
        let path = dir.join(name);
        data.team.write_csv(&path)?;
        outputs.team.push(path);
    }
    for path in outputs.all() {
        info!(path = %path.display(), "output written");
    }
    Ok(outputs)
}

fn derive_records(
    input: InputFrame,
    metrics: Vec<Metric>,
    strict_dates: bool,
    compute: impl Fn(&RawRecord) -> BTreeMap<Metric, f64>,
) -> Result<DerivedFrame, PipelineError> {
    let (columns, numeric, raws) = input.into_parts();
    let mut records = Vec::with_capacity(raws.len());
    let mut unparsed_dates = 0usize;
    for (i, raw) in raws.into_iter().enumerate() {
        let game_date = parse_game_date(&raw.game_date);
        if game_date.is_none() {
            if strict_dates {
                return Err(PipelineError::InvalidDate {
                    row: i + 1,
                    value: raw.game_date.clone(),
                });
            }
            unparsed_dates += 1;
        }
        let metrics = compute(&raw);
        records.push(DerivedRecord {
            raw,
            game_date,
            metrics,
        });
    }
    if unparsed_dates > 0 {
        warn!(rows = unparsed_dates, "game dates kept as raw text");
    }
    Ok(DerivedFrame {
        columns,
        numeric,
        metrics,
        records,
    })
}

// Core pipeline

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub input: Option<PathBuf>,
    pub staging_dir: PathBuf,
    pub canonical_file: PathBuf,
    pub processed_dir: PathBuf,
    pub log_dir: PathBuf,
    pub keyword: String,
    pub database: Option<DbConfig>,
}

impl CoreConfig {
    pub fn from_settings(settings: &Settings, input: Option<PathBuf>) -> Self {
        Self {
            input,
            staging_dir: settings.paths.staging_dir.clone(),
            canonical_file: settings.paths.canonical_file.clone(),
            processed_dir: settings.paths.processed_dir.clone(),
            log_dir: settings.paths.log_dir.clone(),
            keyword: settings.source.keyword.clone(),
            database: settings.database.to_config(),
        }
    }
}

/// Extract → transform → load over the canonical playoffs file.
#[derive(Debug, Clone)]
pub struct CorePipeline {
    config: CoreConfig,
}

impl CorePipeline {
    pub fn new(config: CoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn resolve_input(&self) -> Result<PathBuf, PipelineError> {
        resolve_core_input(
            self.config.input.as_deref(),
            &self.config.staging_dir,
            &self.config.keyword,
            &self.config.canonical_file,
        )
    }

    /// Read and validate the input, then record its shape in the daily stats file.
    pub async fn extract(&self, path: &Path) -> anyhow::Result<ExtractedInput> {
        info!(path = %path.display(), "extracting input");
        let frame = InputFrame::read_csv(path)?;
        frame.require_columns(&CORE_REQUIRED_COLUMNS)?;

        let now = Local::now();
        let stats = ExtractionStats::of(&frame, now);
        let stats_path = self
            .config
            .log_dir
            .join(format!("extraction_stats_{}.txt", now.format("%Y%m%d")));
        write_atomic(&stats_path, stats.render().as_bytes()).await?;
        info!(
            rows = stats.total_rows,
            columns = stats.columns,
            seasons = stats.seasons,
            teams = stats.teams,
            "input extracted"
        );
        Ok(ExtractedInput {
            path: path.to_path_buf(),
            frame,
            stats,
        })
    }

    pub fn transform(&self, input: &ExtractedInput) -> Result<TransformedData, PipelineError> {
        let formula = CoreFormula::for_frame(&input.frame);
        if formula == CoreFormula::Fallback {
            warn!(
                missing = ?input.frame.missing_columns(&PRIMARY_FORMULA_COLUMNS),
                "using fallback metric formulas"
            );
        }
        let minutes_numeric = input.frame.is_numeric(columns::MIN);
        let frame = derive_records(input.frame.clone(), CORE_METRICS.to_vec(), true, |r| {
            core_metrics(r, formula, minutes_numeric)
        })?;

        let season = aggregate(SummaryKind::Season, &frame, &CORE_SEASON_COLUMNS, 2)?;
        let team = aggregate(SummaryKind::Team, &frame, &CORE_TEAM_COLUMNS, 2)?;
        info!(
            records = frame.len(),
            seasons = season.len(),
            teams = team.len(),
            "transform completed"
        );
        Ok(TransformedData {
            frame,
            season,
            team,
        })
    }

    pub fn write_outputs(&self, data: &TransformedData, at: DateTime<Local>) -> anyhow::Result<OutputFiles> {
        write_outputs(&self.config.processed_dir, DETAILED_OUTPUT, data, at)
    }

    pub async fn load(&self, data: &TransformedData) -> LoadOutcome {
        let db = Database::connect(self.config.database.as_ref()).await;
        load_replace(db, &data.frame, &data.season, &data.team).await
    }

    pub async fn run(&self) -> anyhow::Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        info!(%run_id, "starting core etl pipeline");

        let input_path = self.resolve_input()?;
        let input = self
            .extract(&input_path)
            .await
            .with_context(|| format!("extracting {}", input_path.display()))?;
        let data = self.transform(&input).context("transforming input")?;
        let outputs = self.write_outputs(&data, started_at)?;

        let load = self.load(&data).await;
        if let LoadOutcome::Failed(reason) = &load {
            warn!(%reason, "database load failed; data remains available in csv outputs");
        }

        let finished_at = Local::now();
        let marker = write_run_marker(
            &self.config.log_dir,
            "etl_success",
            finished_at,
            &[
                format!("completed_at: {}", finished_at.to_rfc3339()),
                format!("input: {}", input.path.display()),
                format!("rows: {}", input.stats.total_rows),
            ],
        )
        .await?;
        info!(%run_id, marker = %marker.display(), "core etl pipeline completed");

        Ok(PipelineReport {
            run_id,
            started_at,
            finished_at,
            input: input.path,
            rows: input.stats.total_rows,
            outputs,
            load,
            marker,
        })
    }
}

// Advanced transformer

#[derive(Debug, Clone)]
pub struct AdvancedConfig {
    pub input: Option<PathBuf>,
    pub staging_dir: PathBuf,
    pub canonical_file: PathBuf,
    pub processed_dir: PathBuf,
    pub output_dir: PathBuf,
    pub search_root: PathBuf,
    pub log_dir: PathBuf,
    pub keyword: String,
    pub database: Option<DbConfig>,
}

impl AdvancedConfig {
    pub fn from_settings(settings: &Settings, input: Option<PathBuf>) -> Self {
        Self {
            input,
            staging_dir: settings.paths.staging_dir.clone(),
            canonical_file: settings.paths.canonical_file.clone(),
            processed_dir: settings.paths.advanced_output_dir.clone(),
            output_dir: settings.paths.advanced_output_dir.clone(),
            search_root: settings.paths.search_root.clone(),
            log_dir: settings.paths.log_dir.clone(),
            keyword: settings.source.keyword.clone(),
            database: settings.database.to_config(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdvancedTransformer {
    config: AdvancedConfig,
}

impl AdvancedTransformer {
    pub fn new(config: AdvancedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdvancedConfig {
        &self.config
    }

    pub fn resolve_input(&self) -> Result<PathBuf, PipelineError> {
        resolve_advanced_input(
            self.config.input.as_deref(),
            &AdvancedInputSearch {
                canonical_file: &self.config.canonical_file,
                processed_dir: &self.config.processed_dir,
                staging_dir: &self.config.staging_dir,
                search_root: &self.config.search_root,
                keyword: &self.config.keyword,
            },
        )
    }

    pub fn read(&self, path: &Path) -> Result<InputFrame, PipelineError> {
        let frame = InputFrame::read_csv(path)?;
        frame.require_columns(&ADVANCED_REQUIRED_COLUMNS)?;
        info!(path = %path.display(), rows = frame.len(), "input read");
        Ok(frame)
    }

    pub fn transform(&self, input: InputFrame) -> Result<TransformedData, PipelineError> {
        let metrics = available_metrics(&input);
        for metric in Metric::ALL.into_iter().filter(|m| !metrics.contains(m)) {
            warn!(
                metric = metric.column_name(),
                missing = ?input.missing_columns(metric_inputs(metric)),
                "metric skipped"
            );
        }
        let minutes_numeric = input.is_numeric(columns::MIN);
        let selected = metrics.clone();
        let frame = derive_records(input, metrics, false, move |r| {
            advanced_metrics(r, &selected, minutes_numeric)
        })?;

        let (season_columns, team_columns) = advanced_summary_columns(&frame);
        let season = aggregate(SummaryKind::Season, &frame, &season_columns, 3)?;
        let team = aggregate(SummaryKind::Team, &frame, &team_columns, 3)?;
        Ok(TransformedData {
            frame,
            season,
            team,
        })
    }

    pub fn write_outputs(&self, data: &TransformedData, at: DateTime<Local>) -> anyhow::Result<OutputFiles> {
        write_outputs(&self.config.output_dir, ADVANCED_OUTPUT, data, at)
    }

    pub async fn load(&self, data: &TransformedData) -> LoadOutcome {
        let db = Database::connect(self.config.database.as_ref()).await;
        load_adaptive(db, &data.frame, &data.season, &data.team).await
    }

    /// Files are written before any database work and are kept whatever the
    /// load outcome.
    pub async fn run(&self) -> anyhow::Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        info!(%run_id, "starting advanced transform");

        let input_path = self.resolve_input()?;
        let frame = self
            .read(&input_path)
            .with_context(|| format!("reading {}", input_path.display()))?;
        let rows = frame.len();
        let data = self.transform(frame).context("computing advanced metrics")?;
        let outputs = self.write_outputs(&data, started_at)?;

        let load = self.load(&data).await;
        match &load {
            LoadOutcome::Failed(reason) => error!(%reason, "advanced load failed; csv outputs kept"),
            LoadOutcome::Skipped => info!("advanced load skipped"),
            LoadOutcome::Loaded(_) => {}
        }

        let finished_at = Local::now();
        let marker = write_run_marker(
            &self.config.log_dir,
            "advanced_transform_success",
            finished_at,
            &[
                format!("completed_at: {}", finished_at.to_rfc3339()),
                format!("input: {}", input_path.display()),
                format!("rows: {rows}"),
            ],
        )
        .await?;
        info!(%run_id, marker = %marker.display(), "advanced transform completed");

        Ok(PipelineReport {
            run_id,
            started_at,
            finished_at,
            input: input_path,
            rows,
            outputs,
            load,
            marker,
        })
    }
}

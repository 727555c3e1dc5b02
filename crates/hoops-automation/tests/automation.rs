#![cfg(unix)]

use std::path::{Path, PathBuf};

use hoops_automation::{
    AutomationConfig, AutomationError, EtlAutomation, EtlRunner, ExtractorCommand,
};
use hoops_etl::CoreConfig;

fn shell(script: &str) -> ExtractorCommand {
    ExtractorCommand {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

fn automation(root: &Path, extractor: ExtractorCommand) -> EtlAutomation {
    let input = root.join("play_off_totals_2010_2024.csv");
    std::fs::write(
        &input,
        "SEASON_YEAR,TEAM_NAME,GAME_DATE,PTS,FG3M,AST,WL\n\
         2023-24,Boston Celtics,2024-04-21,114,19,28,W\n\
         2023-24,Miami Heat,2024-04-21,94,8,17,L\n",
    )
    .expect("write input");

    EtlAutomation::new(AutomationConfig {
        repo_url: "https://github.com/example/nba-data".to_string(),
        log_dir: root.join("logs"),
        extractor,
        core: CoreConfig {
            input: Some(input),
            staging_dir: root.join("staging"),
            canonical_file: root.join("missing.csv"),
            processed_dir: root.join("processed"),
            log_dir: root.join("logs"),
            keyword: "play_off".to_string(),
            database: None,
        },
    })
}

fn markers(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(prefix))
                .unwrap_or(false)
        })
        .collect()
}

#[tokio::test]
async fn clean_extractor_run_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let automation = automation(dir.path(), shell("echo extracted"));
    automation.run_extraction().await.expect("extraction succeeds");
}

#[tokio::test]
async fn stderr_output_fails_extraction_even_on_zero_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let automation = automation(dir.path(), shell("echo 'warning: partial data' >&2"));
    let err = automation.run_extraction().await.expect_err("extraction fails");
    match err {
        AutomationError::ExtractorStderr(text) => assert_eq!(text, "warning: partial data"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn non_zero_exit_fails_extraction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let automation = automation(dir.path(), shell("echo boom >&2; exit 3"));
    let err = automation.run_extraction().await.expect_err("extraction fails");
    match err {
        AutomationError::ExtractorFailed { stderr, .. } => assert_eq!(stderr, "boom"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn missing_extractor_binary_fails_to_spawn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let automation = automation(
        dir.path(),
        ExtractorCommand {
            program: dir.path().join("no-such-extractor"),
            args: Vec::new(),
        },
    );
    let err = automation.run_extraction().await.expect_err("extraction fails");
    assert!(matches!(err, AutomationError::Spawn(_)));
}

#[tokio::test]
async fn run_etl_writes_automation_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let automation = automation(dir.path(), shell("true"));
    automation.run_etl().await.expect("etl succeeds");

    let logs = dir.path().join("logs");
    assert_eq!(markers(&logs, "etl_success_").len(), 1);
    let automation_markers = markers(&logs, "etl_automation_success_");
    assert_eq!(automation_markers.len(), 1);
    let text = std::fs::read_to_string(&automation_markers[0]).expect("marker");
    assert!(text.contains("source: https://github.com/example/nba-data"));
    assert!(dir.path().join("processed").join("playoffs_detailed.csv").exists());
}

#[tokio::test]
async fn failed_extraction_short_circuits_etl() {
    let dir = tempfile::tempdir().expect("tempdir");
    let automation = automation(dir.path(), shell("exit 1"));
    assert!(automation.run_etl().await.is_err());

    let logs = dir.path().join("logs");
    assert!(markers(&logs, "etl_success_").is_empty());
    assert!(markers(&logs, "etl_automation_success_").is_empty());
    assert!(!dir.path().join("processed").exists());
}

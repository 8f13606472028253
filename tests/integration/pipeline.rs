//! End-to-end runs of the collector against scripted fetchers

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use sp500_archive::export::CsvMirror;
use sp500_archive::{
    ArchiveError, CollectorSettings, DataCollector, FetchError, FetchWindow, RunMode, SymbolOutcome,
};

use crate::common::logging::{log_test_data, log_test_step};
use crate::common::test_data::{create_test_bar, create_test_bars, create_test_universe, date};
use crate::common::{init_fresh_test_archive, MockFetcher, Script, ScriptedFetcher};

fn settings(batch_size: usize) -> CollectorSettings {
    CollectorSettings {
        default_start: date(2023, 1, 1),
        batch_size,
        symbol_delay: Duration::ZERO,
    }
}

#[test_log::test(tokio::test)]
async fn test_failing_symbol_does_not_abort_run() {
    log_test_step("Second of three symbols fails");
    let archive = init_fresh_test_archive().await;

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_bars()
        .withf(|symbol, _| symbol == "AAA" || symbol == "CCC")
        .times(2)
        .returning(|symbol, start| Ok(create_test_bars(symbol, start, 3)));
    fetcher
        .expect_fetch_bars()
        .withf(|symbol, _| symbol == "BBB")
        .times(1)
        .returning(|_, _| Err(FetchError::Http { status: 500 }));

    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5));
    let universe = create_test_universe(&["AAA", "BBB", "CCC"]);

    let summary = collector
        .run(RunMode::Incremental, &universe, date(2024, 1, 12))
        .await
        .expect("run should survive a symbol failure");
    log_test_data("Summary", &summary);

    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].symbol, "BBB");
    assert_eq!(summary.failed[0].reason, "HTTP 500 from provider");
    assert_eq!(archive.store.symbol_count("AAA").await.unwrap(), 3);
    assert_eq!(archive.store.symbol_count("BBB").await.unwrap(), 0);
    assert_eq!(archive.store.symbol_count("CCC").await.unwrap(), 3);
    assert_eq!(summary.total_rows, 6);
}

#[test_log::test(tokio::test)]
async fn test_cold_start_fetches_from_default_start() {
    let archive = init_fresh_test_archive().await;
    let fetcher = Arc::new(
        ScriptedFetcher::new().with("AAPL", Script::Bars(create_test_bars("AAPL", date(2023, 1, 1), 4))),
    );
    let collector = DataCollector::new(archive.store.clone(), fetcher.clone(), settings(5));

    let window = collector.plan(RunMode::Incremental, date(2024, 1, 12)).await.unwrap();
    assert_eq!(window, FetchWindow::FullFromDate { start: date(2023, 1, 1) });

    let summary = collector
        .execute(window, &create_test_universe(&["AAPL"]))
        .await
        .unwrap();

    assert_eq!(fetcher.calls(), vec![("AAPL".to_string(), date(2023, 1, 1))]);
    assert_eq!(summary.watermark, Some(date(2023, 1, 4)));
    assert_eq!(summary.rows_upserted, 4);
}

#[test_log::test(tokio::test)]
async fn test_incremental_run_starts_after_watermark() {
    let archive = init_fresh_test_archive().await;
    archive
        .store
        .upsert("AAPL", &create_test_bars("AAPL", date(2024, 1, 2), 9))
        .await
        .unwrap();

    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with("AAPL", Script::Bars(create_test_bars("AAPL", date(2024, 1, 2), 13)))
            .with("MSFT", Script::Bars(create_test_bars("MSFT", date(2024, 1, 2), 13))),
    );
    let collector = DataCollector::new(archive.store.clone(), fetcher.clone(), settings(5));

    let summary = collector
        .run(RunMode::Incremental, &create_test_universe(&["AAPL", "MSFT"]), date(2024, 1, 15))
        .await
        .unwrap();

    assert_eq!(summary.window, FetchWindow::Incremental { start: date(2024, 1, 11) });
    assert!(fetcher.calls().iter().all(|(_, start)| *start == date(2024, 1, 11)));
    // 2024-01-11 ..= 2024-01-14 for each symbol
    assert_eq!(summary.rows_upserted, 8);
    assert_eq!(archive.store.symbol_count("AAPL").await.unwrap(), 13);
    assert_eq!(archive.store.symbol_count("MSFT").await.unwrap(), 4);
    assert_eq!(summary.watermark, Some(date(2024, 1, 14)));
}

#[test_log::test(tokio::test)]
async fn test_already_current_does_no_work() {
    let archive = init_fresh_test_archive().await;
    archive
        .store
        .upsert("AAPL", &create_test_bars("AAPL", date(2024, 1, 2), 9))
        .await
        .unwrap();

    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch_bars().never();
    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5));

    let summary = collector
        .run(RunMode::Incremental, &create_test_universe(&["AAPL", "MSFT"]), date(2024, 1, 11))
        .await
        .unwrap();

    assert!(summary.is_noop());
    assert_eq!(summary.window, FetchWindow::AlreadyCurrent { watermark: date(2024, 1, 10) });
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.total_rows, 9);
    assert_eq!(summary.watermark, Some(date(2024, 1, 10)));
}

#[test_log::test(tokio::test)]
async fn test_full_rebuild_discards_existing_rows() {
    log_test_step("Full rebuild over a populated archive");
    let archive = init_fresh_test_archive().await;
    archive
        .store
        .upsert("OLD", &create_test_bars("OLD", date(2024, 1, 2), 5))
        .await
        .unwrap();
    archive
        .store
        .upsert("AAPL", &[create_test_bar("AAPL", date(2022, 6, 1), 140.0)])
        .await
        .unwrap();

    let fetcher = ScriptedFetcher::new().with("AAPL", Script::Bars(create_test_bars("AAPL", date(2023, 1, 3), 3)));
    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5));

    let summary = collector
        .run(RunMode::FullRebuild, &create_test_universe(&["AAPL"]), date(2024, 1, 12))
        .await
        .unwrap();

    assert_eq!(summary.window, FetchWindow::FullFromDate { start: date(2023, 1, 1) });
    assert_eq!(archive.store.symbols().await.unwrap(), vec!["AAPL".to_string()]);
    assert_eq!(archive.store.get_bar("AAPL", date(2022, 6, 1)).await.unwrap(), None);
    assert_eq!(archive.store.count().await.unwrap(), 3);
    assert_eq!(summary.total_rows, 3);
}

#[test_log::test(tokio::test)]
async fn test_batches_commit_every_five_symbols() {
    log_test_step("Twelve symbols with batch size five");
    let archive = init_fresh_test_archive().await;

    let symbols: Vec<String> = (1..=12).map(|i| format!("S{:02}", i)).collect();
    let symbol_refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    let mut fetcher = ScriptedFetcher::new().observing(archive.store.clone());
    for symbol in &symbols {
        fetcher = fetcher.with(symbol, Script::Bars(create_test_bars(symbol, date(2024, 1, 2), 2)));
    }
    let fetcher = Arc::new(fetcher);
    let collector = DataCollector::new(archive.store.clone(), fetcher.clone(), settings(5));

    let summary = collector
        .run(RunMode::Incremental, &create_test_universe(&symbol_refs), date(2024, 1, 12))
        .await
        .unwrap();

    assert_eq!(summary.batch_flushes, 2);
    assert_eq!(summary.rows_upserted, 24);
    assert_eq!(archive.store.count().await.unwrap(), 24);

    // rows become visible only at the commits after symbols 5 and 10
    let committed = fetcher.committed_at_call();
    assert_eq!(committed, vec![0, 0, 0, 0, 0, 10, 10, 10, 10, 10, 20, 20]);
}

#[test_log::test(tokio::test)]
async fn test_symbols_processed_in_universe_order() {
    let archive = init_fresh_test_archive().await;
    let fetcher = Arc::new(ScriptedFetcher::new());
    let collector = DataCollector::new(archive.store.clone(), fetcher.clone(), settings(2));

    collector
        .run(RunMode::Incremental, &create_test_universe(&["MSFT", "AAPL", "GOOGL", "AMZN"]), date(2024, 1, 12))
        .await
        .unwrap();

    assert_eq!(fetcher.called_symbols(), vec!["MSFT", "AAPL", "GOOGL", "AMZN"]);
}

#[test_log::test(tokio::test)]
async fn test_empty_and_malformed_results_are_skips() {
    let archive = init_fresh_test_archive().await;

    let mut bad = create_test_bar("BAD", date(2024, 1, 3), 10.0);
    bad.low = -1.0;
    let mut mixed = create_test_bars("MIX", date(2024, 1, 2), 2);
    mixed[0].close = f64::NAN;

    let fetcher = ScriptedFetcher::new()
        .with("GONE", Script::Empty)
        .with("BAD", Script::Bars(vec![bad]))
        .with("MIX", Script::Bars(mixed))
        .with("ERR", Script::Fail("connection reset".into()));
    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5));

    let summary = collector
        .run(RunMode::Incremental, &create_test_universe(&["GONE", "BAD", "MIX", "ERR"]), date(2024, 1, 12))
        .await
        .unwrap();

    assert_eq!(summary.skipped_empty, vec!["GONE".to_string(), "BAD".to_string()]);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.rows_rejected, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].reason, "network error: connection reset");
    assert_eq!(summary.outcomes[2].outcome, SymbolOutcome::Stored { rows: 1, rejected: 1 });
    assert_eq!(archive.store.count().await.unwrap(), 1);
}

#[test_log::test(tokio::test)]
async fn test_rerun_over_same_window_is_idempotent() {
    let archive = init_fresh_test_archive().await;
    let fetcher = Arc::new(
        ScriptedFetcher::new().with("AAPL", Script::Bars(create_test_bars("AAPL", date(2024, 1, 2), 5))),
    );
    let collector = DataCollector::new(archive.store.clone(), fetcher.clone(), settings(5));
    let universe = create_test_universe(&["AAPL"]);
    let window = FetchWindow::Incremental { start: date(2024, 1, 2) };

    collector.execute(window, &universe).await.unwrap();
    let first = archive.store.count().await.unwrap();
    collector.execute(window, &universe).await.unwrap();

    assert_eq!(first, 5);
    assert_eq!(archive.store.count().await.unwrap(), first);
}

#[test_log::test(tokio::test)]
async fn test_mirror_written_and_cleared_on_rebuild() {
    let archive = init_fresh_test_archive().await;
    let mirror_dir = archive.dir.path().join("Stk_data");
    let stale = mirror_dir.join("OLD.csv");
    std::fs::create_dir_all(&mirror_dir).unwrap();
    std::fs::write(&stale, "Date,Open,High,Low,Close,Volume\n").unwrap();

    let fetcher = ScriptedFetcher::new().with("BRK.B", Script::Bars(create_test_bars("BRK.B", date(2023, 1, 3), 2)));
    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5)).with_mirror(CsvMirror::new(&mirror_dir));

    collector
        .run(RunMode::FullRebuild, &create_test_universe(&["BRK.B", "NONE"]), date(2024, 1, 12))
        .await
        .unwrap();

    assert!(!stale.exists());
    let written = std::fs::read_to_string(mirror_dir.join("BRK-B.csv")).unwrap();
    assert_eq!(written.lines().count(), 3);
    assert!(!mirror_dir.join("NONE.csv").exists());
}

#[test_log::test(tokio::test)]
async fn test_rerun_leaves_mirror_without_duplicate_dates() {
    log_test_step("Same window executed twice with a mirror attached");
    let archive = init_fresh_test_archive().await;
    let mirror_dir = archive.dir.path().join("Stk_data");

    let fetcher = ScriptedFetcher::new().with("AAPL", Script::Bars(create_test_bars("AAPL", date(2024, 1, 2), 3)));
    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5)).with_mirror(CsvMirror::new(&mirror_dir));
    let universe = create_test_universe(&["AAPL"]);
    let window = FetchWindow::Incremental { start: date(2024, 1, 2) };

    collector.execute(window, &universe).await.unwrap();
    collector.execute(window, &universe).await.unwrap();

    assert_eq!(archive.store.count().await.unwrap(), 3);
    let written = std::fs::read_to_string(mirror_dir.join("AAPL.csv")).unwrap();
    let dates: Vec<&str> = written.lines().skip(1).map(|l| &l[..10]).collect();
    assert_eq!(dates, vec!["2024-01-02", "2024-01-03", "2024-01-04"]);
}

#[test_log::test(tokio::test)]
async fn test_delay_follows_failed_symbols_too() {
    log_test_step("Pacing between symbols when fetches fail");
    let archive = init_fresh_test_archive().await;
    let delay = Duration::from_millis(150);

    let fetcher = ScriptedFetcher::new()
        .with("AAA", Script::Fail("connection reset".into()))
        .with("BBB", Script::Fail("connection reset".into()))
        .with("CCC", Script::Bars(create_test_bars("CCC", date(2024, 1, 2), 2)));
    let collector = DataCollector::new(
        archive.store.clone(),
        fetcher,
        CollectorSettings {
            default_start: date(2024, 1, 1),
            batch_size: 5,
            symbol_delay: delay,
        },
    );

    let started = std::time::Instant::now();
    let summary = collector
        .run(RunMode::Incremental, &create_test_universe(&["AAA", "BBB", "CCC"]), date(2024, 1, 12))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.failed.len(), 2);
    assert_eq!(summary.succeeded, 1);
    assert!(elapsed >= delay * 2, "three symbols should be paced twice, took {:?}", elapsed);
}

#[test_log::test(tokio::test)]
async fn test_no_delay_after_last_symbol() {
    let archive = init_fresh_test_archive().await;
    let delay = Duration::from_secs(5);
    let fetcher = ScriptedFetcher::new().with("AAPL", Script::Bars(create_test_bars("AAPL", date(2024, 1, 2), 2)));
    let collector = DataCollector::new(
        archive.store.clone(),
        fetcher,
        CollectorSettings {
            default_start: date(2024, 1, 1),
            batch_size: 5,
            symbol_delay: delay,
        },
    );

    let started = std::time::Instant::now();
    collector
        .run(RunMode::Incremental, &create_test_universe(&["AAPL"]), date(2024, 1, 12))
        .await
        .unwrap();

    assert!(started.elapsed() < delay);
}

#[test_log::test(tokio::test)]
async fn test_store_failure_aborts_run() {
    let archive = init_fresh_test_archive().await;
    let fetcher = ScriptedFetcher::new();
    let collector = DataCollector::new(archive.store.clone(), fetcher, settings(5));

    archive.store.clone().close().await;

    let result = collector
        .execute(FetchWindow::Incremental { start: date(2024, 1, 2) }, &create_test_universe(&["AAPL"]))
        .await;
    assert_matches!(result, Err(ArchiveError::StoreUnavailable(_)));
}

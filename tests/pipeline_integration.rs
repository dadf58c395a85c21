//! End-to-end run against mocked exchange endpoints: partial failures,
//! consolidation, and idempotent re-runs.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::FileOptions;
use zip::ZipWriter;

use nse_collector::cache::{CacheStore, JsonFileCache};
use nse_collector::calendar::TradingCalendar;
use nse_collector::collector::SourceCollector;
use nse_collector::http::FetchClient;
use nse_collector::models::Config;
use nse_collector::pipeline::Pipeline;
use nse_collector::sources::{NseCat, NseFo, Source};

fn zip_with_member(name: &str, content: &str) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        writer.start_file(name, FileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

fn fo_zip(date_key: &str, contracts: u32) -> Vec<u8> {
    let csv = format!(
        "INSTRUMENT,NO_OF_CONT,NO_OF_TRADE,NOTION_VAL,PR_VAL\n\
         FUTIDX,{},10,1000.00,50.00\n",
        contracts
    );
    zip_with_member(&format!("op{}.csv", date_key), &csv)
}

const CAT_CSV: &str = "\
Sr,Category,Buy,Sell
1,FII,10.00,20.00
2,Retail,4500.25,4400.75
";

fn test_config(dir: &Path) -> Config {
    Config {
        start_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2025, 2, 6),
        output_path: dir.join("combined.csv"),
        cache_dir: dir.to_path_buf(),
        retry_attempts: 2,
        retry_base_delay_ms: 10,
        request_timeout_secs: 2,
        nse_holidays: HashSet::new(),
        bse_holidays: HashSet::new(),
        ..Config::default()
    }
}

fn build_pipeline(server_uri: &str, dir: &Path) -> Pipeline {
    build_pipeline_with(server_uri, dir, test_config(dir))
}

fn build_pipeline_with(server_uri: &str, dir: &Path, config: Config) -> Pipeline {
    let calendar = TradingCalendar::new(HashSet::new());

    let sources: Vec<Box<dyn Source>> = vec![
        Box::new(NseFo::with_base_url(format!("{}/fo/", server_uri))),
        Box::new(NseCat::with_base_url(format!("{}/cat/", server_uri))),
    ];

    let mut collectors = Vec::new();
    for source in sources {
        let client = FetchClient::new(source.tag(), HeaderMap::new(), None, &config).unwrap();
        let cache_path = dir.join(format!("{}_cache.json", source.id()));
        let cache = JsonFileCache::load(cache_path, source.tag()).unwrap();
        collectors.push(SourceCollector::new(
            source,
            client,
            calendar.clone(),
            Box::new(cache),
            2,
            10,
        ));
    }
    Pipeline::from_collectors(config, collectors)
}

/// 1-2 Feb 2025 are a weekend, so the candidate dates are 3-6 Feb.
async fn mount_exchange(server: &MockServer) {
    // FO archive: 03 and 06 published, 04 never published, 05 flaky then fine
    Mock::given(method("GET"))
        .and(path("/fo/fo03022025.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fo_zip("03022025", 100)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fo/fo04022025.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fo/fo05022025.zip"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fo/fo05022025.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fo_zip("05022025", 300)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fo/fo06022025.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fo_zip("06022025", 400)))
        .mount(server)
        .await;

    // Category turnover published for all four days
    for key in ["030225", "040225", "050225", "060225"] {
        Mock::given(method("GET"))
            .and(path(format!("/cat/fo_cat_turnover_{}.csv", key)))
            .respond_with(ResponseTemplate::new(200).set_body_string(CAT_CSV))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_full_run_tolerates_partial_failures() {
    let server = MockServer::start().await;
    mount_exchange(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let mut pipeline = build_pipeline(&server.uri(), dir.path());
    let report = pipeline.run().await.unwrap();

    let fo_stats = &report.per_source[0].1;
    assert_eq!(fo_stats.considered, 4);
    assert_eq!(fo_stats.fetched, 3); // 03, 06, and (after one retry) 05
    assert_eq!(fo_stats.not_found, 1); // 04
    assert_eq!(fo_stats.failed, 0);

    let cat_stats = &report.per_source[1].1;
    assert_eq!(cat_stats.fetched, 4);

    // Every date with any data gets a row
    assert_eq!(report.rows_written, 4);

    let content = fs::read_to_string(dir.path().join("combined.csv")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(
        lines[0],
        "Date,NSE_NO_OF_CONT,NSE_NO_OF_TRADE,NSE_NOTION_VAL,NSE_PR_VAL,\
         NSE_CAT_RETAIL_BUY_CR,NSE_CAT_RETAIL_SELL_CR,NSE_CAT_RETAIL_AVG_CR"
    );
    assert_eq!(
        lines[1],
        "03-02-2025,100.00,10.00,1000.00,50.00,4500.25,4400.75,4450.50"
    );
    // FO cells on 04-02 are missing markers, never zeros
    assert_eq!(lines[2], "04-02-2025,,,,,4500.25,4400.75,4450.50");
    assert!(lines[3].starts_with("05-02-2025,300.00"));
    assert!(lines[4].starts_with("06-02-2025,400.00"));

    // Unpublished dates are not cached; successful ones are
    let fo_cache = JsonFileCache::load(dir.path().join("nse_fo_cache.json"), "NSE").unwrap();
    assert_eq!(fo_cache.len(), 3);
}

#[tokio::test]
async fn test_rerun_serves_from_cache_and_rewrites_identically() {
    let server = MockServer::start().await;
    mount_exchange(&server).await;
    let dir = tempfile::tempdir().unwrap();

    build_pipeline(&server.uri(), dir.path())
        .run()
        .await
        .unwrap();
    let first = fs::read(dir.path().join("combined.csv")).unwrap();

    // Fresh pipeline over the same cache dir: cached dates are not
    // re-requested, only the never-published 04-02 is probed again.
    let mut second_pipeline = build_pipeline(&server.uri(), dir.path());
    let report = second_pipeline.run().await.unwrap();

    let fo_stats = &report.per_source[0].1;
    assert_eq!(fo_stats.cache_hits, 3);
    assert_eq!(fo_stats.fetched, 0);
    assert_eq!(fo_stats.not_found, 1);

    let second = fs::read(dir.path().join("combined.csv")).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_extended_range_backfills_without_refetching() {
    let server = MockServer::start().await;
    mount_exchange(&server).await;
    let dir = tempfile::tempdir().unwrap();

    // First run covers only 03-02
    let mut narrow_config = test_config(dir.path());
    narrow_config.end_date = NaiveDate::from_ymd_opt(2025, 2, 3);
    let mut pipeline = build_pipeline_with(&server.uri(), dir.path(), narrow_config);
    let report = pipeline.run().await.unwrap();
    assert_eq!(report.rows_written, 1);

    // Second run extends the range to 06-02; 03-02 comes from cache
    let mut extended = build_pipeline(&server.uri(), dir.path());
    let report = extended.run().await.unwrap();
    assert_eq!(report.rows_written, 4);
    let fo_stats = &report.per_source[0].1;
    assert_eq!(fo_stats.cache_hits, 1);
    assert_eq!(fo_stats.fetched, 2); // 05-02 (after a retry) and 06-02
}

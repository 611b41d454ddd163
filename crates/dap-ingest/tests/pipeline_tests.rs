//! End-to-end pipeline tests
//!
//! Each test runs the coordinator against `wiremock` upstreams and checks the
//! resulting descriptors, event log and staged tree.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use dap_ingest::models::{DescriptorUpdate, EventKind};
use dap_ingest::{ErrorKind, IngestError, SourceState};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DAILY_HREF: &str = "/static/20240115_daily.zip";

async fn mount_studies(server: &MockServer, page: String) {
    Mock::given(method("GET"))
        .and(path("/pipe_files"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(server)
        .await;
}

async fn mount_labels(server: &MockServer, partitions: usize) {
    let files: Vec<String> = (0..partitions)
        .map(|i| format!("{}/drug/label/drug-label-{:04}-of-{:04}.json.zip", server.uri(), i + 1, partitions))
        .collect();
    Mock::given(method("GET"))
        .and(path("/download.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(label_index(&files, "2024-01-12")))
        .mount(server)
        .await;
    for i in 0..partitions {
        Mock::given(method("GET"))
            .and(path(format!("/drug/label/drug-label-{:04}-of-{:04}.json.zip", i + 1, partitions)))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(label_partition(i, 2), "application/zip"),
            )
            .expect(1)
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_studies_happy_path() {
    let server = MockServer::start().await;
    mount_studies(&server, studies_page(DAILY_HREF, "01/15/2024")).await;
    Mock::given(method("GET"))
        .and(path(DAILY_HREF))
        .respond_with(ResponseTemplate::new(200).set_body_raw(studies_bundle(), "application/zip"))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new(&studies_section("aact", &server.uri(), 7)).await;
    let now = utc(2024, 1, 16, 6);
    env.prepare(
        now,
        "aact",
        DescriptorUpdate { last_extracted: Some(utc(2024, 1, 1, 0)), ..Default::default() },
    )
    .await;

    let report = env.coordinator(now).run(&[]).await.unwrap();

    assert_eq!(report.state_of("aact"), Some(SourceState::Done));
    assert_eq!(report.exit_code(), 0);

    let descriptor = env.repo.get_descriptor("aact").await.unwrap();
    assert_eq!(descriptor.uris, vec![format!("{}{}", server.uri(), DAILY_HREF)]);
    assert_eq!(descriptor.source_updated, Some(utc(2024, 1, 15, 0)));
    assert_eq!(descriptor.last_extracted, Some(now));
    assert_eq!(descriptor.last_staged, Some(now));
    assert!(!descriptor.has_changed);

    let events = env.events("aact").await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Visit, EventKind::Fetch, EventKind::Stage]);
    assert!(events[0].return_value.contains("has_changed=true"));
    assert!(events.iter().all(|e| e.return_code == 0));

    assert_eq!(env.staged("aact"), vec!["sponsors.csv", "studies.csv"]);
    let studies = std::fs::read_to_string(env.staging_dir("aact").join("studies.csv")).unwrap();
    assert_eq!(
        studies,
        "nct_id,brief_title,phase\nNCT001,Aspirin trial,Phase 3\nNCT002,Statin trial,Phase 2\n"
    );
}

#[tokio::test]
async fn test_approvals_not_due_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drugsfda"))
        .respond_with(ResponseTemplate::new(200).set_body_string(approvals_page("/media/89850/download")))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/media/89850/download"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Last-Modified", "Mon, 15 Jan 2024 00:00:00 GMT"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/89850/download"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = TestEnv::new(&approvals_section("approvals", &server.uri(), 7)).await;
    let now = utc(2024, 1, 16, 6);
    let last_extracted = now - chrono::Duration::days(1);
    env.prepare(
        now,
        "approvals",
        DescriptorUpdate { last_extracted: Some(last_extracted), ..Default::default() },
    )
    .await;
    let before = env.repo.get_descriptor("approvals").await.unwrap();

    let report = env.coordinator(now).run(&[]).await.unwrap();

    assert_eq!(report.state_of("approvals"), Some(SourceState::Skipped));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(env.kinds("approvals").await, vec![EventKind::Visit, EventKind::Skip]);

    let after = env.repo.get_descriptor("approvals").await.unwrap();
    assert_eq!(after.last_extracted, before.last_extracted);
    assert_eq!(after.last_staged, before.last_staged);
    assert!(!after.has_changed);
    assert_eq!(after.last_updated, Some(now));
    assert!(env.staged("approvals").is_empty());
}

#[tokio::test]
async fn test_labels_three_partitions() {
    let server = MockServer::start().await;
    mount_labels(&server, 3).await;

    let env = TestEnv::new(&labels_section("labels", &server.uri(), 7)).await;
    let report = env.coordinator(utc(2024, 1, 16, 6)).run(&[]).await.unwrap();

    assert_eq!(report.state_of("labels"), Some(SourceState::Done));
    assert_eq!(
        env.staged("labels"),
        vec!["partition_000.csv", "partition_001.csv", "partition_002.csv"]
    );

    let events = env.events("labels").await;
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Stage).count(), 1);
    let fetch = events.iter().find(|e| e.kind == EventKind::Fetch).unwrap();
    assert!(fetch.return_value.contains("uris=3"));

    let descriptor = env.repo.get_descriptor("labels").await.unwrap();
    assert_eq!(descriptor.uris.len(), 3);
    assert_eq!(descriptor.source_updated, Some(utc(2024, 1, 12, 0)));

    let first = std::fs::read_to_string(env.staging_dir("labels").join("partition_000.csv")).unwrap();
    assert_eq!(
        first,
        "id,openfda.route,purpose\nlabel-0-0,ORAL,Pain relief\nlabel-0-1,ORAL,Pain relief\n"
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    mount_studies(&server, studies_page(DAILY_HREF, "01/15/2024")).await;
    Mock::given(method("GET"))
        .and(path(DAILY_HREF))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DAILY_HREF))
        .respond_with(ResponseTemplate::new(200).set_body_raw(studies_bundle(), "application/zip"))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new(&studies_section("aact", &server.uri(), 7)).await;
    let report = env.coordinator(utc(2024, 1, 16, 6)).run(&[]).await.unwrap();

    assert_eq!(report.state_of("aact"), Some(SourceState::Done));
    let fetches: Vec<_> = env
        .events("aact")
        .await
        .into_iter()
        .filter(|e| e.kind == EventKind::Fetch)
        .collect();
    assert_eq!(fetches.len(), 1);
    assert!(fetches[0].return_value.contains("retries=2"), "{}", fetches[0].return_value);
}

#[tokio::test]
async fn test_transient_index_failure_is_retried_during_visit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/download.json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_labels(&server, 1).await;

    let env = TestEnv::new(&labels_section("labels", &server.uri(), 7)).await;
    let report = env.coordinator(utc(2024, 1, 16, 6)).run(&[]).await.unwrap();

    assert_eq!(report.state_of("labels"), Some(SourceState::Done));
    assert_eq!(
        env.kinds("labels").await,
        vec![EventKind::Visit, EventKind::Fetch, EventKind::Stage]
    );
    assert_eq!(env.staged("labels"), vec!["partition_000.csv"]);
}

#[tokio::test]
async fn test_layout_change_fails_source_and_run_continues() {
    let server = MockServer::start().await;
    mount_studies(&server, studies_page("/static/202401_monthly.zip", "01/01/2024")).await;
    mount_labels(&server, 1).await;

    let sections = format!(
        "{}{}",
        studies_section("aact", &server.uri(), 7),
        labels_section("labels", &server.uri(), 7)
    );
    let env = TestEnv::new(&sections).await;
    let report = env.coordinator(utc(2024, 1, 16, 6)).run(&[]).await.unwrap();

    assert_eq!(
        report.state_of("aact"),
        Some(SourceState::Failed(ErrorKind::UpstreamLayoutChanged))
    );
    assert_eq!(report.state_of("labels"), Some(SourceState::Done));
    assert_eq!(report.exit_code(), 30);

    let events = env.events("aact").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Error);
    assert_eq!(events[0].return_code, 30);
    assert!(events[0].return_value.starts_with("UpstreamLayoutChanged"));

    let descriptor = env.repo.get_descriptor("aact").await.unwrap();
    assert!(descriptor.uris.is_empty());
    assert_eq!(descriptor.last_extracted, None);
}

#[tokio::test]
async fn test_unsafe_archive_member_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drugsfda"))
        .respond_with(ResponseTemplate::new(200).set_body_string(approvals_page("/media/1/download")))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/media/1/download"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Last-Modified", "Mon, 15 Jan 2024 00:00:00 GMT"),
        )
        .mount(&server)
        .await;
    let bundle = zip_bytes(&[
        ("Products.txt", "ApplNo\tProductNo\n000004\t004\n"),
        ("../etc/passwd", "root:x:0:0:root:/root:/bin/sh\n"),
    ]);
    Mock::given(method("GET"))
        .and(path("/media/1/download"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(bundle, "application/zip"))
        .mount(&server)
        .await;

    let env = TestEnv::new(&approvals_section("approvals", &server.uri(), 7)).await;
    let report = env.coordinator(utc(2024, 1, 16, 6)).run(&[]).await.unwrap();

    assert_eq!(
        report.state_of("approvals"),
        Some(SourceState::Failed(ErrorKind::UnsafeArchiveMember))
    );
    assert_eq!(report.exit_code(), 31);
    assert_eq!(env.kinds("approvals").await, vec![EventKind::Visit, EventKind::Error]);

    let extract = env.extract_dir("approvals");
    assert!(!extract.join("etc").exists());
    assert!(!extract.join("000").join("Products.txt").exists());
    assert!(env.staged("approvals").is_empty());

    let descriptor = env.repo.get_descriptor("approvals").await.unwrap();
    assert_eq!(descriptor.last_extracted, None);
}

#[tokio::test]
async fn test_second_run_with_same_clock_skips_everything() {
    let server = MockServer::start().await;
    mount_labels(&server, 1).await;
    mount_studies(&server, studies_page(DAILY_HREF, "01/15/2024")).await;
    Mock::given(method("GET"))
        .and(path(DAILY_HREF))
        .respond_with(ResponseTemplate::new(200).set_body_raw(studies_bundle(), "application/zip"))
        .expect(1)
        .mount(&server)
        .await;

    let sections = format!(
        "{}{}",
        studies_section("aact", &server.uri(), 7),
        labels_section("labels", &server.uri(), 7)
    );
    let env = TestEnv::new(&sections).await;
    let now = utc(2024, 1, 16, 6);

    let first = env.coordinator(now).run(&[]).await.unwrap();
    assert!(first.outcomes.iter().all(|o| o.state == SourceState::Done));
    let staged = std::fs::read(env.staging_dir("aact").join("studies.csv")).unwrap();

    let second = env.coordinator(now).run(&[]).await.unwrap();
    assert!(second.outcomes.iter().all(|o| o.state == SourceState::Skipped));
    assert_eq!(second.exit_code(), 0);

    assert_eq!(
        env.kinds("labels").await,
        vec![
            EventKind::Visit,
            EventKind::Fetch,
            EventKind::Stage,
            EventKind::Visit,
            EventKind::Skip
        ]
    );
    assert_eq!(std::fs::read(env.staging_dir("aact").join("studies.csv")).unwrap(), staged);
}

#[tokio::test]
async fn test_zero_partitions_stage_nothing() {
    let server = MockServer::start().await;
    mount_labels(&server, 0).await;

    let env = TestEnv::new(&labels_section("labels", &server.uri(), 7)).await;
    let report = env.coordinator(utc(2024, 1, 16, 6)).run(&[]).await.unwrap();

    assert_eq!(report.state_of("labels"), Some(SourceState::Done));
    assert_eq!(
        env.kinds("labels").await,
        vec![EventKind::Visit, EventKind::Fetch, EventKind::Stage]
    );
    assert!(env.staged("labels").is_empty());

    // No partition dates, so the index export date applies
    let descriptor = env.repo.get_descriptor("labels").await.unwrap();
    assert_eq!(descriptor.source_updated, Some(utc(2024, 1, 10, 0)));
}

#[tokio::test]
async fn test_selected_sources_only() {
    let server = MockServer::start().await;
    mount_labels(&server, 1).await;

    let sections = format!(
        "{}{}",
        studies_section("aact", &server.uri(), 7),
        labels_section("labels", &server.uri(), 7)
    );
    let env = TestEnv::new(&sections).await;
    let report = env
        .coordinator(utc(2024, 1, 16, 6))
        .run(&["labels".to_string()])
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert!(env.kinds("aact").await.is_empty());

    let err = env
        .coordinator(utc(2024, 1, 16, 6))
        .run(&["nope".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ConfigNotFound(_)));
    assert_eq!(err.exit_code(), 10);
}

#[tokio::test]
async fn test_cancellation_during_fetch() {
    let server = MockServer::start().await;
    mount_studies(&server, studies_page(DAILY_HREF, "01/15/2024")).await;
    Mock::given(method("GET"))
        .and(path(DAILY_HREF))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(studies_bundle(), "application/zip")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    mount_labels_index_only(&server).await;

    let sections = format!(
        "{}{}",
        studies_section("aact", &server.uri(), 7),
        labels_section("labels", &server.uri(), 7)
    );
    let env = TestEnv::new(&sections).await;
    let coordinator = env.coordinator(utc(2024, 1, 16, 6));
    let token = coordinator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let report = coordinator.run(&[]).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.exit_code(), 50);
    assert_eq!(report.state_of("aact"), Some(SourceState::Failed(ErrorKind::Cancelled)));
    assert_eq!(report.state_of("labels"), Some(SourceState::Failed(ErrorKind::Cancelled)));

    let aact = env.events("aact").await;
    assert_eq!(aact.last().unwrap().return_value, "cancelled");
    assert_eq!(aact.last().unwrap().return_code, 50);
    assert_eq!(env.kinds("labels").await, vec![EventKind::Error]);

    assert!(!env.extract_dir("aact").join("000").exists());
    assert_eq!(env.repo.get_descriptor("aact").await.unwrap().last_extracted, None);
}

async fn mount_labels_index_only(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/download.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(label_index(&[], "2024-01-12")))
        .expect(0)
        .mount(server)
        .await;
}

//! Metadata repository integration tests against a file-backed SQLite store

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use dap_ingest::models::{DescriptorUpdate, EventKind, NewEvent};
use dap_ingest::MetadataRepository;

#[tokio::test]
async fn test_descriptor_round_trip_after_update() {
    let env = TestEnv::new(&labels_section("labels", "http://localhost:9", 7)).await;
    let now = utc(2024, 1, 16, 6);
    env.coordinator(now).seed().await.unwrap();
    let original = env.repo.get_descriptor("labels").await.unwrap();

    let update = DescriptorUpdate {
        uris: Some(vec![
            "https://download.open.fda.gov/drug/label/drug-label-0001-of-0002.json.zip".into(),
            "https://download.open.fda.gov/drug/label/drug-label-0002-of-0002.json.zip".into(),
        ]),
        source_updated: Some(utc(2024, 1, 12, 0)),
        last_extracted: Some(now),
        last_staged: Some(now),
        last_updated: Some(now),
        has_changed: Some(true),
        lifecycle_days: Some(14),
        ..Default::default()
    };
    let mut expected = original.clone();
    update.apply_to(&mut expected);

    env.repo.update_descriptor("labels", &update).await.unwrap();
    let mut stored = env.repo.get_descriptor("labels").await.unwrap();

    assert_eq!(stored.version, original.version + 1);
    assert!(stored.updated >= original.updated);
    stored.updated = expected.updated;
    stored.version = expected.version;
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn test_repository_survives_reopen() {
    let env = TestEnv::new(&labels_section("labels", "http://localhost:9", 7)).await;
    let now = utc(2024, 1, 16, 6);
    env.coordinator(now).seed().await.unwrap();
    env.repo
        .append_event(&NewEvent {
            source_name: "labels".into(),
            kind: EventKind::Skip,
            start: now,
            end: now,
            return_code: 0,
            return_value: "not due".into(),
            artifact_uri: None,
        })
        .await
        .unwrap();
    env.repo.close().await;

    let reopened = MetadataRepository::open_path(&env.profile.paths.repository).await.unwrap();
    assert_eq!(reopened.list_sources().await.unwrap().len(), 1);
    let events = reopened.events_for("labels", Some(now)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].return_value, "not due");
}

#[tokio::test]
async fn test_seed_is_idempotent_and_follows_profile_edits() {
    let env = TestEnv::new(&format!(
        "{}{}",
        labels_section("labels", "http://localhost:9", 7),
        studies_section("aact", "http://localhost:9", 7)
    ))
    .await;
    let now = utc(2024, 1, 16, 6);

    assert_eq!(env.coordinator(now).seed().await.unwrap(), 2);
    assert_eq!(env.coordinator(now).seed().await.unwrap(), 0);
    assert_eq!(env.repo.get_descriptor("aact").await.unwrap().version, 1);

    let mut profile = env.profile.clone();
    profile.sources.iter_mut().find(|s| s.name == "aact").unwrap().lifecycle_days = 30;
    let coordinator = dap_ingest::Coordinator::new(profile, env.repo.clone());
    assert_eq!(coordinator.seed().await.unwrap(), 0);

    let aact = env.repo.get_descriptor("aact").await.unwrap();
    assert_eq!(aact.lifecycle_days, 30);
    assert_eq!(aact.version, 2);
    assert_eq!(env.repo.get_descriptor("labels").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_due_sources_query() {
    let env = TestEnv::new(&format!(
        "{}{}",
        labels_section("labels", "http://localhost:9", 7),
        studies_section("aact", "http://localhost:9", 7)
    ))
    .await;
    let now = utc(2024, 1, 16, 6);
    env.prepare(
        now,
        "labels",
        DescriptorUpdate {
            last_extracted: Some(utc(2024, 1, 15, 0)),
            source_updated: Some(utc(2024, 1, 14, 0)),
            ..Default::default()
        },
    )
    .await;

    let due: Vec<String> =
        env.repo.get_due_sources(now).await.unwrap().into_iter().map(|d| d.name).collect();
    assert_eq!(due, vec!["aact"]);
}

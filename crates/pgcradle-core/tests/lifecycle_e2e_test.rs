// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle tests against a real engine bundle.
//!
//! These need an actual PostgreSQL bundle. Point
//! `PGCRADLE_TEST_ARTIFACT` at a local bundle file (jar/txz/zip) or an
//! HTTP(S) URL and the tests run the full lifecycle; without it they
//! skip.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pgcradle_core::archive::ExtractionStrategy;
use pgcradle_core::controllers::OutputFormat;
use pgcradle_core::{
    ArchiveRestoreInitializer, Artifact, DataClusterConfiguration, InitDbInitializer,
    InstanceConfiguration, PlatformParameters, ServerBuilder, ServerOptions, ShutdownParameters,
    StartupParameters,
};

fn artifact_source() -> Option<String> {
    match std::env::var("PGCRADLE_TEST_ARTIFACT") {
        Ok(source) if !source.is_empty() => Some(source),
        _ => {
            eprintln!("PGCRADLE_TEST_ARTIFACT not set, skipping engine lifecycle test");
            None
        }
    }
}

fn strategy_for(source: &str) -> ExtractionStrategy {
    if source.to_ascii_lowercase().ends_with(".jar") {
        ExtractionStrategy::Zonky
    } else {
        ExtractionStrategy::Sharp
    }
}

#[tokio::test]
async fn full_lifecycle_with_archive_round_trip() {
    let Some(source) = artifact_source() else {
        return;
    };
    let temp = tempfile::TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let primary_port = common::free_port();
    let standby_port = common::free_port();
    let platform = PlatformParameters {
        set_executable_attributes: true,
        ..PlatformParameters::default()
    };
    let options = ServerOptions::new(
        InstanceConfiguration::new(temp.path().join("instance")).platform(platform),
    )
    .cluster(
        DataClusterConfiguration::new("primary", primary_port)
            .data_directory("data-primary")
            .parameter("max_connections", "8"),
    )
    .cluster(
        DataClusterConfiguration::new("standby1", standby_port).data_directory("data-standby1"),
    )
    .clean_install();

    let artifact = Artifact::main(&source, temp.path().join("cache")).strategy(strategy_for(&source));
    let server = ServerBuilder::new()
        .build(options, vec![artifact], &cancel)
        .await
        .unwrap();

    // Boot the primary and seed a table.
    let primary = server.cluster("primary").await.unwrap();
    let initializer = InitDbInitializer::new();
    primary
        .start(&StartupParameters::new(), Some(&initializer), &cancel)
        .await
        .unwrap();
    let status = primary.status(&cancel).await.unwrap();
    assert!(status.is_valid());
    assert_eq!(status.port, primary_port);

    primary
        .execute_sql(
            "CREATE TABLE books(id INT); INSERT INTO books VALUES (1),(2),(3)",
            None,
            None,
            None,
            &OutputFormat::new(),
            &cancel,
        )
        .await
        .unwrap();

    // Archive the primary, restore the archive into the standby.
    let archive = temp.path().join("primary.zip");
    primary
        .archive(&archive, &ShutdownParameters::new(), &cancel)
        .await
        .unwrap();
    assert!(!primary.status(&cancel).await.unwrap().is_valid());

    let standby = server.cluster("standby1").await.unwrap();
    let restore = ArchiveRestoreInitializer::new(&archive);
    standby.initialize(&restore, &cancel).await.unwrap();
    standby
        .start(&StartupParameters::new(), None, &cancel)
        .await
        .unwrap();

    let rows = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = rows.clone();
    standby
        .execute_sql(
            "SELECT count(*) FROM books",
            None,
            None,
            Some(Arc::new(move |line: &str| {
                sink.lock().unwrap().push(line.trim().to_string());
            })),
            &OutputFormat::csv().tuples_only(),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(rows.lock().unwrap().first().map(String::as_str), Some("3"));

    // Idempotence: stopping a stopped cluster and re-stopping the
    // standby are both no-ops.
    primary
        .stop(&ShutdownParameters::new(), &cancel)
        .await
        .unwrap();
    standby
        .stop(&ShutdownParameters::new(), &cancel)
        .await
        .unwrap();
    standby
        .stop(&ShutdownParameters::new(), &cancel)
        .await
        .unwrap();

    // Tear everything down.
    for cluster in server.clusters().await {
        cluster
            .destroy(&ShutdownParameters::new(), &cancel)
            .await
            .unwrap();
        assert!(!cluster.data_path().exists());
    }
    ServerBuilder::new()
        .destroy_instance(
            &ServerOptions::new(InstanceConfiguration::new(temp.path().join("instance"))),
            &cancel,
        )
        .await
        .unwrap();
    assert!(!temp.path().join("instance").exists());
}

#[tokio::test]
async fn databases_listing_includes_postgres() {
    let Some(source) = artifact_source() else {
        return;
    };
    let temp = tempfile::TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let port = common::free_port();
    let platform = PlatformParameters {
        set_executable_attributes: true,
        ..PlatformParameters::default()
    };
    let options = ServerOptions::new(
        InstanceConfiguration::new(temp.path().join("instance")).platform(platform),
    )
    .cluster(DataClusterConfiguration::new("primary", port))
    .clean_install();

    let artifact = Artifact::main(&source, temp.path().join("cache")).strategy(strategy_for(&source));
    let server = ServerBuilder::new()
        .build(options, vec![artifact], &cancel)
        .await
        .unwrap();
    let cluster = server.cluster("primary").await.unwrap();

    let initializer = InitDbInitializer::new();
    cluster
        .start(&StartupParameters::new(), Some(&initializer), &cancel)
        .await
        .unwrap();

    match cluster.environment().sql() {
        Ok(_) => {
            let rows = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = rows.clone();
            cluster
                .list_databases(
                    Arc::new(move |row| sink.lock().unwrap().push(row.name)),
                    &cancel,
                )
                .await
                .unwrap();
            let rows = rows.lock().unwrap();
            assert!(rows.len() >= 3, "expected template databases, got {rows:?}");
            assert!(rows.iter().any(|name| name == "postgres"));
        }
        Err(_) => {
            // Minimal bundle: listing must fail with a capability error.
            let err = cluster
                .list_databases(Arc::new(|_| {}), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, pgcradle_core::Error::MissingCapability(_)));
        }
    }

    cluster
        .destroy(&ShutdownParameters::new(), &cancel)
        .await
        .unwrap();
}

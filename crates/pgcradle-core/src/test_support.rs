// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for in-crate tests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::environment::{Environment, EnvironmentBuilder, OPTIONAL_BINARIES};
use crate::exec::{MockCommandExecutor, MockResponse};
use crate::fs::FileSystem;
use crate::options::{DataClusterConfiguration, InstanceConfiguration};

/// A mocked environment over a temporary instance directory.
pub(crate) struct TestEnvironment {
    pub temp: tempfile::TempDir,
    pub mock: Arc<MockCommandExecutor>,
    pub environment: Arc<Environment>,
}

async fn build_environment(standard: bool) -> TestEnvironment {
    let temp = tempfile::TempDir::new().expect("temp dir");
    let mock = Arc::new(MockCommandExecutor::new());
    if !standard {
        for name in OPTIONAL_BINARIES {
            mock.enqueue(name, MockResponse::exit(127));
        }
    }
    let environment = EnvironmentBuilder::new(FileSystem::new(), mock.clone())
        .build(
            InstanceConfiguration::new(temp.path()),
            HashMap::new(),
            &CancellationToken::new(),
        )
        .await
        .expect("test environment build");
    TestEnvironment {
        temp,
        mock,
        environment: Arc::new(environment),
    }
}

/// An environment with every optional controller present.
pub(crate) async fn standard_environment() -> TestEnvironment {
    build_environment(true).await
}

/// An environment with no optional controllers.
pub(crate) async fn minimal_environment() -> TestEnvironment {
    build_environment(false).await
}

/// Mark a cluster initialized: data directory with a `PG_VERSION`
/// marker and a minimal `global/` tree.
pub(crate) fn seed_initialized(env: &TestEnvironment, cluster: &DataClusterConfiguration) {
    let data = cluster.data_path(env.temp.path());
    std::fs::create_dir_all(data.join("global")).expect("seed data dir");
    std::fs::write(data.join("PG_VERSION"), b"16\n").expect("seed marker");
    std::fs::write(data.join("global/pg_control"), b"ctl").expect("seed control");
}

/// Make the next status probe observe a running postmaster: zero exit
/// from pg_ctl (the mock default) plus a parseable pid file.
pub(crate) fn running_pid_file(
    env: &TestEnvironment,
    cluster: &DataClusterConfiguration,
    port: u16,
) {
    let data = cluster.data_path(env.temp.path());
    std::fs::create_dir_all(&data).expect("seed data dir");
    std::fs::write(
        data.join("postmaster.pid"),
        format!("4242\n{}\n1722470400\n{port}\nlocalhost\n", data.display()),
    )
    .expect("seed pid file");
}

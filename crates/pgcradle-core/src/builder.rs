// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end server construction.
//!
//! Wires the default services and walks the pipeline: validate the
//! options and artifact set, materialize artifacts, build the instance,
//! validate the binaries, apply fix-ups, and register every configured
//! cluster on the resulting server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::archive::ExtractorFactory;
use crate::artifact::{self, Artifact, ArtifactBuilder};
use crate::download::{HttpDownloader, RetryPolicy};
use crate::environment::EnvironmentBuilder;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, NativeCommandExecutor};
use crate::fs::FileSystem;
use crate::instance::InstanceBuilder;
use crate::options::ServerOptions;
use crate::server::Server;

/// Builds [`Server`]s from options and an artifact set.
#[derive(Clone)]
pub struct ServerBuilder {
    fs: FileSystem,
    executor: Arc<dyn CommandExecutor>,
    retry_policy: RetryPolicy,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// A builder over the host executor and default retry policy.
    pub fn new() -> Self {
        Self {
            fs: FileSystem::new(),
            executor: Arc::new(NativeCommandExecutor::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Replace the process executor.
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replace the download retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn instance_builder(&self) -> InstanceBuilder {
        let downloader = HttpDownloader::with_policy(self.fs.clone(), self.retry_policy.clone());
        InstanceBuilder::new(
            ArtifactBuilder::new(downloader, self.fs.clone()),
            self.fs.clone(),
            ExtractorFactory::new(),
        )
    }

    /// Build a server: instance on disk, validated environment, and
    /// one registered cluster per configured cluster.
    ///
    /// When the freshly built instance fails binary validation and
    /// `clean_install` is set, the instance directory is wiped and
    /// rebuilt once before the failure is surfaced.
    pub async fn build(
        &self,
        options: ServerOptions,
        artifacts: Vec<Artifact>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Server>> {
        options.validate()?;
        artifact::validate_set(&artifacts)?;

        let instance_builder = self.instance_builder();
        instance_builder
            .build(&options, artifacts.clone(), cancel)
            .await?;

        let environment_builder = EnvironmentBuilder::new(self.fs.clone(), self.executor.clone());
        let instance_dir = options.instance.instance_directory.clone();
        let versions = match environment_builder.validate(&instance_dir, cancel).await {
            Ok(versions) => versions,
            Err(Error::Validation(message)) if options.clean_install => {
                warn!(
                    instance = %instance_dir.display(),
                    message,
                    "Installation failed validation, rebuilding"
                );
                self.fs.delete_directory(&instance_dir).await?;
                instance_builder.build(&options, artifacts, cancel).await?;
                environment_builder.validate(&instance_dir, cancel).await?
            }
            Err(e) => return Err(e),
        };

        let environment = environment_builder
            .build(options.instance.clone(), versions, cancel)
            .await?;
        let server = Arc::new(Server::new(Arc::new(environment)));
        for cluster in options.clusters {
            server.add_cluster(cluster).await?;
        }
        Ok(server)
    }

    /// Delete the instance directory described by `options`.
    pub async fn destroy_instance(
        &self,
        options: &ServerOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.instance_builder().destroy(options, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ExtractionStrategy;
    use crate::environment::{EnvironmentMode, REQUIRED_BINARIES};
    use crate::exec::MockCommandExecutor;
    use crate::options::{DataClusterConfiguration, InstanceConfiguration};
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn build_engine_zip(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        for name in REQUIRED_BINARIES {
            writer
                .start_file(format!("pgsql/bin/{name}"), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"#!").unwrap();
        }
        writer
            .start_file("pgsql/share/postgresql.conf.sample", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"# defaults").unwrap();
        writer.finish().unwrap();
    }

    fn options_for(temp: &TempDir) -> ServerOptions {
        ServerOptions::new(InstanceConfiguration::new(temp.path().join("instance")))
            .cluster(DataClusterConfiguration::new("primary", 5561))
    }

    #[tokio::test]
    async fn build_produces_a_server_with_registered_clusters() {
        let temp = TempDir::new().unwrap();
        let bundle = temp.path().join("pg.zip");
        build_engine_zip(&bundle);

        let server = ServerBuilder::new()
            .executor(Arc::new(MockCommandExecutor::new()))
            .build(
                options_for(&temp),
                vec![
                    Artifact::main(bundle.to_string_lossy(), temp.path().join("cache"))
                        .strategy(ExtractionStrategy::System),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(server.cluster("primary").await.is_some());
        assert_eq!(server.environment().mode(), EnvironmentMode::Standard);
        assert!(temp.path().join("instance/bin/pg_ctl").is_file());
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_extraction() {
        let temp = TempDir::new().unwrap();
        let options =
            ServerOptions::new(InstanceConfiguration::new(temp.path().join("instance")));

        let err = ServerBuilder::new()
            .executor(Arc::new(MockCommandExecutor::new()))
            .build(options, vec![], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!temp.path().join("instance").exists());
    }

    #[tokio::test]
    async fn incomplete_bundle_fails_validation_without_clean_install() {
        let temp = TempDir::new().unwrap();
        let bundle = temp.path().join("broken.zip");
        let file = std::fs::File::create(&bundle).unwrap();
        let mut writer = ZipWriter::new(file);
        writer
            .start_file("pgsql/bin/initdb", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"#!").unwrap();
        writer.finish().unwrap();

        let err = ServerBuilder::new()
            .executor(Arc::new(MockCommandExecutor::new()))
            .build(
                options_for(&temp),
                vec![
                    Artifact::main(bundle.to_string_lossy(), temp.path().join("cache"))
                        .strategy(ExtractionStrategy::System),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn destroy_instance_removes_the_tree() {
        let temp = TempDir::new().unwrap();
        let options = options_for(&temp);
        std::fs::create_dir_all(temp.path().join("instance/bin")).unwrap();

        ServerBuilder::new()
            .destroy_instance(&options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!temp.path().join("instance").exists());
    }
}

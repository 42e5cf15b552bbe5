// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment probing and binding.
//!
//! Validates an extracted instance, applies platform fix-ups, and binds
//! the controllers. The required binaries (`initdb`, `pg_ctl`,
//! `postgres`) define a minimal environment; `psql`, `pg_dump`, and
//! `pg_restore` are probed individually and their absence leaves the
//! matching capability off.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{Compressor, ExtractorFactory};
use crate::controllers::{
    ClusterController, DumpController, InitDbController, RestoreController, SqlController,
    probe_version,
};
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecSpec};
use crate::fanout;
use crate::fs::FileSystem;
use crate::options::InstanceConfiguration;

/// Fan-out degree while resetting file attributes.
const NORMALIZE_PARALLELISM: usize = 32;

/// Sentinel gating the once-per-instance permission grant.
#[cfg(windows)]
const PERMISSIONS_SENTINEL: &str = "permissions.sentinel";

/// Binaries every instance must provide under `bin/`.
pub const REQUIRED_BINARIES: [&str; 3] = ["initdb", "pg_ctl", "postgres"];

/// Binaries that switch on optional capabilities.
pub const OPTIONAL_BINARIES: [&str; 3] = ["psql", "pg_dump", "pg_restore"];

#[cfg(windows)]
fn binary_file_name(base: &str) -> String {
    format!("{base}.exe")
}

#[cfg(not(windows))]
fn binary_file_name(base: &str) -> String {
    base.to_string()
}

/// Overall capability level of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentMode {
    /// Only `initdb` and `pg_ctl` are available.
    Minimal,
    /// SQL execution, dump, and restore are all available.
    Standard,
}

/// One optional capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// SQL execution via psql.
    Sql,
    /// Export via pg_dump.
    Dump,
    /// Import via pg_restore.
    Restore,
}

impl Capability {
    /// The binary backing this capability.
    pub fn binary(&self) -> &'static str {
        match self {
            Capability::Sql => "psql",
            Capability::Dump => "pg_dump",
            Capability::Restore => "pg_restore",
        }
    }
}

/// A bound instance: probed versions, services, and controllers.
pub struct Environment {
    instance: InstanceConfiguration,
    versions: HashMap<String, String>,
    fs: FileSystem,
    compressor: Compressor,
    extractors: ExtractorFactory,
    initdb: InitDbController,
    cluster_ctl: ClusterController,
    sql: Option<SqlController>,
    dump: Option<DumpController>,
    restore: Option<RestoreController>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("instance", &self.instance.instance_directory)
            .field("mode", &self.mode())
            .field("versions", &self.versions)
            .finish()
    }
}

impl Environment {
    /// The instance configuration this environment was built from.
    pub fn instance(&self) -> &InstanceConfiguration {
        &self.instance
    }

    /// The instance directory.
    pub fn instance_directory(&self) -> &Path {
        &self.instance.instance_directory
    }

    /// Versions probed from the binaries, keyed by binary name.
    pub fn versions(&self) -> &HashMap<String, String> {
        &self.versions
    }

    /// The filesystem service.
    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    /// The archive compressor.
    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// The extractor factory.
    pub fn extractors(&self) -> &ExtractorFactory {
        &self.extractors
    }

    /// The initdb controller.
    pub fn initdb(&self) -> &InitDbController {
        &self.initdb
    }

    /// The pg_ctl controller.
    pub fn cluster_controller(&self) -> &ClusterController {
        &self.cluster_ctl
    }

    /// The psql controller, or a capability failure.
    pub fn sql(&self) -> Result<&SqlController> {
        self.sql
            .as_ref()
            .ok_or(Error::MissingCapability(Capability::Sql.binary()))
    }

    /// The pg_dump controller, or a capability failure.
    pub fn dump(&self) -> Result<&DumpController> {
        self.dump
            .as_ref()
            .ok_or(Error::MissingCapability(Capability::Dump.binary()))
    }

    /// The pg_restore controller, or a capability failure.
    pub fn restore(&self) -> Result<&RestoreController> {
        self.restore
            .as_ref()
            .ok_or(Error::MissingCapability(Capability::Restore.binary()))
    }

    /// Standard iff every optional controller is present.
    pub fn mode(&self) -> EnvironmentMode {
        if self.missing_capabilities().is_empty() {
            EnvironmentMode::Standard
        } else {
            EnvironmentMode::Minimal
        }
    }

    /// The optional capabilities this environment lacks.
    pub fn missing_capabilities(&self) -> Vec<Capability> {
        let mut missing = Vec::new();
        if self.sql.is_none() {
            missing.push(Capability::Sql);
        }
        if self.dump.is_none() {
            missing.push(Capability::Dump);
        }
        if self.restore.is_none() {
            missing.push(Capability::Restore);
        }
        missing
    }
}

/// Builds [`Environment`]s over extracted instances.
#[derive(Clone)]
pub struct EnvironmentBuilder {
    fs: FileSystem,
    executor: Arc<dyn CommandExecutor>,
}

impl EnvironmentBuilder {
    /// Create a builder.
    pub fn new(fs: FileSystem, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { fs, executor }
    }

    /// Assert the required binaries exist and respond to `--version`,
    /// returning the `binary name → version` map.
    pub async fn validate(
        &self,
        instance_directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>> {
        let bin_dir = instance_directory.join("bin");
        let fs = self.fs.clone();
        let executor = self.executor.clone();
        let cancel = cancel.clone();

        let probes = fanout::for_each(
            REQUIRED_BINARIES.to_vec(),
            REQUIRED_BINARIES.len(),
            move |name| {
                let fs = fs.clone();
                let executor = executor.clone();
                let cancel = cancel.clone();
                let path = bin_dir.join(binary_file_name(name));
                async move {
                    let result: Result<String> = async {
                        fs.require_file(&path).await?;
                        probe_version(&executor, &path, &cancel).await
                    }
                    .await;
                    (name, result)
                }
            },
        )
        .await;

        let mut versions = HashMap::new();
        let mut problems = Vec::new();
        for (name, result) in probes {
            match result {
                Ok(version) => {
                    debug!(binary = name, version = %version, "Probed version");
                    versions.insert(name.to_string(), version);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => problems.push(format!("{name}: {e}")),
            }
        }
        if !problems.is_empty() {
            return Err(Error::Validation(format!(
                "instance at {} is not usable: {}",
                instance_directory.display(),
                problems.join("; ")
            )));
        }
        Ok(versions)
    }

    /// Apply platform fix-ups, bind the controllers, and return the
    /// environment. `versions` is the map a prior [`Self::validate`]
    /// returned.
    pub async fn build(
        &self,
        instance: InstanceConfiguration,
        mut versions: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Environment> {
        if instance.platform.normalize_attributes {
            self.normalize_attributes(&instance.instance_directory).await?;
        }
        #[cfg(unix)]
        if instance.platform.set_executable_attributes {
            self.set_executable_attributes(&instance, cancel).await?;
        }
        #[cfg(windows)]
        if instance.platform.add_local_user_access_permission {
            self.grant_local_user_access(&instance, cancel).await?;
        }

        let bin_dir = instance.bin_directory();
        let directory = instance.instance_directory.clone();

        let initdb = InitDbController::new(
            bin_dir.join(binary_file_name("initdb")),
            directory.clone(),
            self.fs.clone(),
            self.executor.clone(),
        );
        let cluster_ctl = ClusterController::new(
            bin_dir.join(binary_file_name("pg_ctl")),
            directory.clone(),
            self.fs.clone(),
            self.executor.clone(),
        );

        let mut optional: HashMap<&'static str, PathBuf> = HashMap::new();
        for capability in [Capability::Sql, Capability::Dump, Capability::Restore] {
            let name = capability.binary();
            let path = bin_dir.join(binary_file_name(name));
            match probe_version(&self.executor, &path, cancel).await {
                Ok(version) => {
                    versions.insert(name.to_string(), version);
                    optional.insert(name, path);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(binary = name, error = %e, "Optional binary unavailable, capability off");
                }
            }
        }

        let sql = optional.remove(Capability::Sql.binary()).map(|path| {
            SqlController::new(path, directory.clone(), self.fs.clone(), self.executor.clone())
        });
        let dump = optional.remove(Capability::Dump.binary()).map(|path| {
            DumpController::new(path, directory.clone(), self.fs.clone(), self.executor.clone())
        });
        let restore = optional.remove(Capability::Restore.binary()).map(|path| {
            RestoreController::new(path, directory.clone(), self.fs.clone(), self.executor.clone())
        });

        let environment = Environment {
            instance,
            versions,
            fs: self.fs.clone(),
            compressor: Compressor::new(),
            extractors: ExtractorFactory::new(),
            initdb,
            cluster_ctl,
            sql,
            dump,
            restore,
        };
        info!(
            instance = %environment.instance.instance_directory.display(),
            mode = ?environment.mode(),
            "Environment ready"
        );
        Ok(environment)
    }

    /// Reset attributes to normal on every entry of the instance tree.
    async fn normalize_attributes(&self, instance_directory: &Path) -> Result<()> {
        let entries = self.fs.enumerate(instance_directory, None, true).await?;
        let results = fanout::for_each(entries, NORMALIZE_PARALLELISM, |path| async move {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(Error::fs("probe", &path)(e)),
            };
            let mut permissions = meta.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                tokio::fs::set_permissions(&path, permissions)
                    .await
                    .map_err(Error::fs("set attributes", &path))?;
            }
            Ok(())
        })
        .await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Set the executable bit on the required binaries via `chmod`.
    #[cfg(unix)]
    async fn set_executable_attributes(
        &self,
        instance: &InstanceConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bin_dir = instance.bin_directory();
        for name in REQUIRED_BINARIES {
            let path = bin_dir.join(binary_file_name(name));
            let spec = ExecSpec::new("chmod")
                .arg("+x")
                .arg(path.to_string_lossy());
            self.executor.execute(spec, cancel).await?;
        }
        Ok(())
    }

    /// Grant the current user full control on the instance tree, once
    /// per instance directory. The sentinel is create-or-skip; a failed
    /// grant removes it so the next build retries.
    #[cfg(windows)]
    async fn grant_local_user_access(
        &self,
        instance: &InstanceConfiguration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sentinel = instance.instance_directory.join(PERMISSIONS_SENTINEL);
        if !self.fs.touch_sentinel(&sentinel).await? {
            return Ok(());
        }
        let user = std::env::var("USERNAME").map_err(|_| {
            Error::Validation("USERNAME is not set; cannot grant access".to_string())
        })?;
        let spec = ExecSpec::new("icacls")
            .arg(instance.instance_directory.to_string_lossy())
            .arg("/t")
            .arg("/grant:r")
            .arg(format!("{user}:(OI)(CI)F"));
        if let Err(e) = self.executor.execute(spec, cancel).await {
            self.fs.delete_file(&sentinel).await?;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockCommandExecutor, MockResponse};
    use crate::options::PlatformParameters;
    use tempfile::TempDir;

    fn seed_required_binaries(temp: &TempDir) {
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        for name in REQUIRED_BINARIES {
            std::fs::write(bin.join(name), b"#!").unwrap();
        }
    }

    fn version_response(name: &str) -> MockResponse {
        MockResponse::ok([format!("{name} (PostgreSQL) 16.4")])
    }

    #[tokio::test]
    async fn validate_returns_the_version_map() {
        let temp = TempDir::new().unwrap();
        seed_required_binaries(&temp);
        let mock = Arc::new(MockCommandExecutor::new());
        for name in REQUIRED_BINARIES {
            mock.enqueue(name, version_response(name));
        }

        let builder = EnvironmentBuilder::new(FileSystem::new(), mock);
        let versions = builder
            .validate(temp.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(versions.len(), 3);
        assert_eq!(versions["pg_ctl"], "pg_ctl (PostgreSQL) 16.4");
    }

    #[tokio::test]
    async fn validate_reports_every_missing_binary() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("initdb"), b"#!").unwrap();

        let mock = Arc::new(MockCommandExecutor::new());
        let builder = EnvironmentBuilder::new(FileSystem::new(), mock);
        let err = builder
            .validate(temp.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("pg_ctl"));
        assert!(message.contains("postgres"));
        assert!(!message.contains("initdb:"));
    }

    #[tokio::test]
    async fn validate_fails_on_non_zero_version_probe() {
        let temp = TempDir::new().unwrap();
        seed_required_binaries(&temp);
        let mock = Arc::new(MockCommandExecutor::new());
        mock.enqueue("postgres", MockResponse::exit(127));

        let builder = EnvironmentBuilder::new(FileSystem::new(), mock);
        let err = builder
            .validate(temp.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }

    #[tokio::test]
    async fn build_detects_a_standard_environment() {
        let temp = TempDir::new().unwrap();
        seed_required_binaries(&temp);
        let mock = Arc::new(MockCommandExecutor::new());
        for name in OPTIONAL_BINARIES {
            mock.enqueue(name, version_response(name));
        }

        let builder = EnvironmentBuilder::new(FileSystem::new(), mock);
        let environment = builder
            .build(
                InstanceConfiguration::new(temp.path()),
                HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(environment.mode(), EnvironmentMode::Standard);
        assert!(environment.missing_capabilities().is_empty());
        assert!(environment.sql().is_ok());
        assert!(environment.versions().contains_key("psql"));
    }

    #[tokio::test]
    async fn build_reports_each_missing_optional_binary() {
        let temp = TempDir::new().unwrap();
        seed_required_binaries(&temp);
        let mock = Arc::new(MockCommandExecutor::new());
        mock.enqueue("psql", version_response("psql"));
        mock.enqueue("pg_dump", MockResponse::exit(127));
        mock.enqueue("pg_restore", MockResponse::exit(127));

        let builder = EnvironmentBuilder::new(FileSystem::new(), mock);
        let environment = builder
            .build(
                InstanceConfiguration::new(temp.path()),
                HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(environment.mode(), EnvironmentMode::Minimal);
        assert_eq!(
            environment.missing_capabilities(),
            vec![Capability::Dump, Capability::Restore]
        );
        assert!(environment.sql().is_ok());
        assert!(matches!(
            environment.dump().unwrap_err(),
            Error::MissingCapability("pg_dump")
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executable_attribute_fixup_invokes_chmod_per_binary() {
        let temp = TempDir::new().unwrap();
        seed_required_binaries(&temp);
        let mock = Arc::new(MockCommandExecutor::new());

        let instance = InstanceConfiguration::new(temp.path()).platform(PlatformParameters {
            set_executable_attributes: true,
            ..PlatformParameters::default()
        });
        let builder = EnvironmentBuilder::new(FileSystem::new(), mock.clone());
        builder
            .build(instance, HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();

        let chmods = mock.recorded_for("chmod");
        assert_eq!(chmods.len(), 3);
        assert!(chmods.iter().all(|c| c.args[0] == "+x"));
        assert!(chmods[0].args[1].ends_with("bin/initdb"));
    }

    #[tokio::test]
    async fn normalize_attributes_clears_readonly() {
        let temp = TempDir::new().unwrap();
        seed_required_binaries(&temp);

        let readonly_file = temp.path().join("share/readonly.conf");
        std::fs::create_dir_all(readonly_file.parent().unwrap()).unwrap();
        std::fs::write(&readonly_file, b"x").unwrap();
        let mut permissions = std::fs::metadata(&readonly_file).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&readonly_file, permissions).unwrap();

        let mock = Arc::new(MockCommandExecutor::new());
        let instance = InstanceConfiguration::new(temp.path()).platform(PlatformParameters {
            normalize_attributes: true,
            ..PlatformParameters::default()
        });
        EnvironmentBuilder::new(FileSystem::new(), mock)
            .build(instance, HashMap::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!std::fs::metadata(&readonly_file).unwrap().permissions().readonly());
    }
}

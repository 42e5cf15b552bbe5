// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgcradle - embedded PostgreSQL instances from the command line.
//!
//! Covers the orchestration surface of pgcradle-core:
//! - `instance check`: validate an extracted instance and print versions
//! - `instance create`: download/extract engine bundles into an instance
//! - `instance destroy`: delete an instance tree
//! - `test`: full create → init → start → status → stop → destroy cycle

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pgcradle_core::archive::{ExtractorFactory, ExtractionStrategy};
use pgcradle_core::artifact::ArtifactBuilder;
use pgcradle_core::controllers::OutputFormat;
use pgcradle_core::download::HttpDownloader;
use pgcradle_core::environment::EnvironmentBuilder;
use pgcradle_core::exec::NativeCommandExecutor;
use pgcradle_core::fs::FileSystem;
use pgcradle_core::instance::InstanceBuilder;
use pgcradle_core::{
    Artifact, DataClusterConfiguration, InitDbInitializer, InstanceConfiguration,
    PlatformParameters, ServerBuilder, ServerOptions, ShutdownParameters, StartupParameters,
};

#[derive(Parser)]
#[command(name = "pgcradle")]
#[command(about = "Embedded PostgreSQL instances without a pre-installed server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instance management commands
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// Run a full lifecycle smoke test on one cluster
    Test {
        #[command(flatten)]
        create: CreateArgs,
        /// Port the test cluster binds
        #[arg(short, long)]
        port: u16,
        /// Cluster superuser
        #[arg(long, default_value = "postgres")]
        superuser: String,
        /// Keep the instance directory after the test
        #[arg(long)]
        keep: bool,
    },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Validate an instance's binaries and print their versions
    Check {
        /// Instance directory
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Create an instance from engine bundles
    Create {
        #[command(flatten)]
        args: CreateArgs,
    },
    /// Delete an instance directory tree
    Destroy {
        /// Instance directory
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[derive(clap::Args, Clone)]
struct CreateArgs {
    /// Instance directory
    #[arg(short, long)]
    dir: PathBuf,
    /// Main engine bundle: absolute path or HTTP(S) URL
    #[arg(short, long)]
    main: String,
    /// Extension bundle (repeatable)
    #[arg(short, long = "extension", action = clap::ArgAction::Append)]
    extensions: Vec<String>,
    /// Cache directory for downloaded bundles
    #[arg(long, default_value = "bundle-cache")]
    cache_dir: PathBuf,
    /// Extraction strategy (system, sharp, zonky)
    #[arg(long, default_value = "sharp")]
    strategy: String,
    /// Re-download bundles even when cached
    #[arg(long)]
    force_download: bool,
    /// Delete and re-extract the instance directory first
    #[arg(long)]
    clean_install: bool,
    /// Skip the bundled pgAdmin installation
    #[arg(long)]
    exclude_pgadmin: bool,
}

impl CreateArgs {
    fn strategy(&self) -> anyhow::Result<ExtractionStrategy> {
        ExtractionStrategy::from_str(&self.strategy)
            .map_err(|_| anyhow::anyhow!("unknown extraction strategy {:?}", self.strategy))
    }

    fn artifacts(&self) -> anyhow::Result<Vec<Artifact>> {
        let strategy = self.strategy()?;
        let mut main = Artifact::main(&self.main, &self.cache_dir).strategy(strategy);
        if self.force_download {
            main = main.force();
        }
        let mut artifacts = vec![main];
        for extension in &self.extensions {
            let mut artifact = Artifact::extension(extension, &self.cache_dir);
            if self.force_download {
                artifact = artifact.force();
            }
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }

    fn options(&self) -> ServerOptions {
        let platform = PlatformParameters {
            set_executable_attributes: cfg!(unix),
            add_local_user_access_permission: cfg!(windows),
            normalize_attributes: false,
        };
        let mut options = ServerOptions::new(
            InstanceConfiguration::new(&self.dir).platform(platform),
        );
        if self.clean_install {
            options = options.clean_install();
        }
        if self.exclude_pgadmin {
            options = options.exclude_pgadmin_installation();
        }
        options
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgcradle=info,pgcradle_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Instance { action } => match action {
            InstanceAction::Check { dir } => check_instance(dir, &cancel).await,
            InstanceAction::Create { args } => create_instance(args, &cancel).await,
            InstanceAction::Destroy { dir } => destroy_instance(dir, &cancel).await,
        },
        Commands::Test {
            create,
            port,
            superuser,
            keep,
        } => run_test(create, port, superuser, keep, &cancel).await,
    }
}

async fn check_instance(dir: PathBuf, cancel: &CancellationToken) -> anyhow::Result<()> {
    let builder = EnvironmentBuilder::new(FileSystem::new(), Arc::new(NativeCommandExecutor::new()));
    let versions = builder
        .validate(&dir, cancel)
        .await
        .context("instance validation failed")?;

    let mut names: Vec<&String> = versions.keys().collect();
    names.sort();
    for name in names {
        println!("{name}: {}", versions[name]);
    }
    Ok(())
}

async fn create_instance(args: CreateArgs, cancel: &CancellationToken) -> anyhow::Result<()> {
    let fs = FileSystem::new();
    let builder = InstanceBuilder::new(
        ArtifactBuilder::new(HttpDownloader::new(fs.clone()), fs.clone()),
        fs.clone(),
        ExtractorFactory::new(),
    );
    builder
        .build(&args.options(), args.artifacts()?, cancel)
        .await
        .context("instance build failed")?;

    check_instance(args.dir.clone(), cancel).await?;
    info!(instance = %args.dir.display(), "Instance created");
    Ok(())
}

async fn destroy_instance(dir: PathBuf, cancel: &CancellationToken) -> anyhow::Result<()> {
    let options = ServerOptions::new(InstanceConfiguration::new(&dir));
    ServerBuilder::new()
        .destroy_instance(&options, cancel)
        .await
        .context("instance destroy failed")?;
    println!("destroyed {}", dir.display());
    Ok(())
}

async fn run_test(
    create: CreateArgs,
    port: u16,
    superuser: String,
    keep: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let cluster_config = DataClusterConfiguration::new("smoke", port).superuser(superuser);
    let options = create.options().cluster(cluster_config);

    let server = ServerBuilder::new()
        .build(options.clone(), create.artifacts()?, cancel)
        .await
        .context("server build failed")?;
    let cluster = server
        .cluster("smoke")
        .await
        .expect("configured cluster is registered");

    let initializer = InitDbInitializer::new();
    cluster
        .start(&StartupParameters::new(), Some(&initializer), cancel)
        .await
        .context("cluster start failed")?;

    let status = cluster.status(cancel).await?;
    anyhow::ensure!(status.is_valid(), "cluster reports no running postmaster");
    println!("postmaster pid {} on port {}", status.pid, status.port);

    match cluster
        .execute_sql("SELECT 1", None, None, None, &OutputFormat::new(), cancel)
        .await
    {
        Ok(()) => println!("SELECT 1 ok"),
        Err(pgcradle_core::Error::MissingCapability(binary)) => {
            println!("minimal environment ({binary} absent), skipping SQL check");
        }
        Err(e) => return Err(e).context("SQL check failed"),
    }

    cluster
        .stop(&ShutdownParameters::new(), cancel)
        .await
        .context("cluster stop failed")?;
    cluster
        .destroy(&ShutdownParameters::new(), cancel)
        .await
        .context("cluster destroy failed")?;

    if !keep {
        ServerBuilder::new().destroy_instance(&options, cancel).await?;
        info!(instance = %create.dir.display(), "Instance removed");
    }
    println!("lifecycle test passed");
    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgcradle - Embedded PostgreSQL Orchestration
//!
//! This crate embeds a full PostgreSQL engine inside an application
//! process tree: it acquires the engine's native binaries, materializes
//! isolated on-disk instances from them, and drives the lifecycle of
//! one or more data clusters per instance through the engine's own
//! binaries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Caller (app, test harness, CLI)             │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  ServerBuilder                                                   │
//! │  options ─▶ ArtifactBuilder ─▶ InstanceBuilder ─▶ Environment    │
//! │             (download/cache)   (extract bundles)  (probe + bind) │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Server ──▶ N × DataCluster ──▶ Controllers ──▶ engine binaries  │
//! │  (fan-out,     (state machine)   (initdb, pg_ctl, psql,          │
//! │   events)                         pg_dump, pg_restore)           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Cluster lifecycle
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──start──▶ Running
//!                                    ▲                    │
//!                                    └────────stop────────┘
//!                         destroy: stop if running, delete data dir
//! ```
//!
//! State is read from disk on every probe: `PG_VERSION` marks a cluster
//! initialized, a valid `postmaster.pid` marks it running. Nothing else
//! is persisted by this crate.
//!
//! # Capability modes
//!
//! An environment is **minimal** when only `initdb` and `pg_ctl` are
//! usable, and **standard** when `psql`, `pg_dump`, and `pg_restore`
//! all probe successfully. Each optional controller is reported
//! individually via [`Environment::missing_capabilities`].
//!
//! # Modules
//!
//! - [`archive`]: extraction strategies and the zip compressor
//! - [`artifact`]: bundle descriptors and materialization
//! - [`builder`]: end-to-end server construction
//! - [`cluster`]: per-cluster state machine
//! - [`controllers`]: typed front-ends for the engine binaries
//! - [`download`]: retrying HTTP downloads into a shared cache
//! - [`environment`]: instance validation, fix-ups, capability binding
//! - [`error`]: the crate error type
//! - [`exec`]: process invocation and output streaming
//! - [`fs`]: filesystem service
//! - [`initializer`]: initdb / archive-restore / compound strategies
//! - [`instance`]: instance directory materialization
//! - [`options`]: configuration records and validation
//! - [`server`]: multi-cluster façade with bounded fan-out

#![deny(missing_docs)]

pub mod archive;
pub mod artifact;
pub mod builder;
pub mod cluster;
pub mod controllers;
pub mod download;
pub mod environment;
pub mod error;
pub mod exec;
mod fanout;
pub mod fs;
pub mod initializer;
pub mod instance;
pub mod options;
pub mod server;

#[cfg(test)]
mod test_support;

pub use artifact::{Artifact, ArtifactKind};
pub use builder::ServerBuilder;
pub use cluster::DataCluster;
pub use environment::{Capability, Environment, EnvironmentMode};
pub use error::{Error, Result};
pub use initializer::{
    ArchiveRestoreInitializer, ClusterInitializer, CompoundInitializer, InitDbInitializer,
};
pub use options::{
    DataClusterConfiguration, InstanceConfiguration, PlatformParameters, ServerOptions,
    ShutdownMode, ShutdownParameters, StartupParameters,
};
pub use server::{ClusterEvent, ClusterOperation, FanOutOptions, Server};

//! Process supervision, directory watching and incremental file parsing
//! for live DEMPS runs.
//!
//! # Modules
//!
//! - [`config`] -- Service configuration loaded from `demps-config.yaml`.
//! - [`directives`] -- Run directives parsed from `sim.ini`.
//! - [`layout`] -- [`LineTransform`] trait and configurable dataset layouts.
//! - [`pool`] -- [`ResourcePool`] of singleton closeable resources.
//! - [`processor`] -- [`FileProcessor`]: one file at a time, one
//!   aggregation per file.
//! - [`signal`] -- Process-group signal delivery.
//! - [`supervisor`] -- [`ProcessSupervisor`] for the simulator process.
//! - [`watcher`] -- [`DirectoryWatcher`] over `notify`, tolerant of
//!   missing paths.
//!
//! [`LineTransform`]: layout::LineTransform
//! [`ResourcePool`]: pool::ResourcePool
//! [`FileProcessor`]: processor::FileProcessor
//! [`ProcessSupervisor`]: supervisor::ProcessSupervisor
//! [`DirectoryWatcher`]: watcher::DirectoryWatcher

pub mod config;
pub mod directives;
pub mod layout;
pub mod pool;
pub mod processor;
pub mod signal;
pub mod supervisor;
pub mod watcher;

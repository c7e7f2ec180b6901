//! Backup orchestration service.
//!
//! An HTTP control surface triggers, schedules and reports on filesystem
//! backups; the actual data movement is delegated to external tools (ZFS for
//! snapshots, restic for the repository, rclone for remote mirroring).

pub mod config;
pub mod errors;
pub mod notify;
pub mod orchestrator;
pub mod repo;
pub mod scheduler;
pub mod server;
pub mod snapshot;
pub mod sync;
pub mod utils;

//! Core types for PACS series retention
//!
//! This crate provides:
//! - Series and archive record data structures
//! - Retention policy (eligibility by last update)
//! - Configuration loading and validation
//! - Archive root layout (dated buckets, scratch space, atomic promotion)
//! - tar.gz container writer and verifier
//! - BLAKE3 checksums for committed containers

pub mod config;
pub mod container;
pub mod error;
pub mod hash;
pub mod layout;
pub mod policy;
pub mod record;
pub mod series;

// Re-exports
pub use config::{Config, DatabaseBackend};
pub use container::{ContainerReader, ContainerWriter};
pub use error::{ConfigError, ContainerError};
pub use layout::ArchiveLayout;
pub use policy::{is_eligible, RetentionPolicy};
pub use record::{ArchiveRecord, CommitInfo, RecordFilter, RecordStatus};
pub use series::{SeriesMetadata, StudyMetadata};

//! Filesystem and timestamp helpers shared by the executor and orchestrator.

pub mod files;
pub mod timestamps;

pub use files::{copy_into, glob_to_regex, is_non_empty_file, matching_files, missing_or_empty};
pub use timestamps::{format_duration, iso_timestamp, Timestamp};

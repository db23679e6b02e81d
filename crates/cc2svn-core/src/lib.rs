//! cc2svn core library: converts ClearCase history into a Subversion dump
//! stream.
//!
//! The pipeline reads per-element history through a [`history::HistorySource`],
//! filters it, derives the branch topology, folds events into revisions, and
//! writes them with the [`dump`] writer.  File content is retrieved through a
//! verifying on-disk [`cache`], and progress is persisted by the
//! [`checkpoint`] store so an interrupted run resumes at the next revision.

pub mod assembler;
pub mod autoprops;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod dump;
pub mod engine;
pub mod errors;
pub mod filters;
pub mod history;
pub mod models;
pub mod store;
pub mod topology;
pub mod tree;

pub use cache::{BlobSource, ContentCache};
pub use checkpoint::CheckpointStore;
pub use config::EngineConfig;
pub use engine::{ConversionReport, Converter, OutputPlacement};
pub use errors::{ConvertError, ConvertResult, SourceError};
pub use history::HistorySource;

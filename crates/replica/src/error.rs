//! Error types for the replica engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or replaying the diff log.
#[derive(Debug, Error)]
pub enum ReplicaError {
	/// I/O failure on the log file.
	#[error("i/o error on diff log {path}: {source}")]
	Io {
		/// Log file involved.
		path: PathBuf,
		/// Underlying I/O error.
		source: std::io::Error,
	},

	/// A log line failed to deserialize; replay aborts.
	#[error("malformed diff at line {line}: {source}")]
	MalformedLine {
		/// Zero-based line number of the offending record.
		line: usize,
		/// Underlying JSON error.
		source: serde_json::Error,
	},
}

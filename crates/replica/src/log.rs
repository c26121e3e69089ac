//! The append-only diff log.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use quill_proto::Diff;

use crate::diff::{apply_diffs_sequential, compute_diffs};
use crate::error::ReplicaError;

/// A site's diff log: one serialized [`Diff`] per line, created lazily.
///
/// Replaying the log from the empty string yields the committed text;
/// every mutation goes through an append (or a whole-log rewrite when a
/// join installs a snapshot).
#[derive(Debug, Clone)]
pub struct DiffLog {
	path: PathBuf,
}

impl DiffLog {
	/// Creates a handle for the log at `path`. The file itself is only
	/// created on first use.
	#[must_use]
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// The log file location.
	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn io_err(&self, source: std::io::Error) -> ReplicaError {
		ReplicaError::Io {
			path: self.path.clone(),
			source,
		}
	}

	fn ensure_exists(&self) -> std::io::Result<()> {
		if self.path.exists() {
			return Ok(());
		}
		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			std::fs::create_dir_all(parent)?;
		}
		std::fs::File::create(&self.path).map(drop)
	}

	/// Computes the diffs from `old` to `new` and appends them, one line
	/// each. Returns the appended diffs for forwarding.
	pub fn append(&self, old: &str, new: &str) -> std::io::Result<Vec<Diff>> {
		let diffs = compute_diffs(old, new);
		self.append_diffs(&diffs)?;
		Ok(diffs)
	}

	/// Appends already-computed diffs, one line each.
	///
	/// Each record is flushed with its newline in a single write, so a
	/// reader never observes a torn line.
	pub fn append_diffs(&self, diffs: &[Diff]) -> std::io::Result<()> {
		if diffs.is_empty() {
			return Ok(());
		}
		self.ensure_exists()?;
		let mut file = OpenOptions::new().append(true).open(&self.path)?;
		for d in diffs {
			let record = serde_json::to_string(d)
				.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
			writeln!(file, "{record}")?;
		}
		file.flush()
	}

	fn read_diffs_from(&self, start_line: usize) -> Result<Vec<Diff>, ReplicaError> {
		self.ensure_exists().map_err(|e| self.io_err(e))?;
		let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;

		let mut diffs = Vec::new();
		for (line, record) in content.lines().enumerate() {
			if line < start_line {
				continue;
			}
			let d: Diff = serde_json::from_str(record)
				.map_err(|source| ReplicaError::MalformedLine { line, source })?;
			diffs.push(d);
		}
		Ok(diffs)
	}

	/// Replays log lines from `start_line` onto `base` and returns the
	/// resulting text.
	pub fn replay_from(&self, start_line: usize, base: &str) -> Result<String, ReplicaError> {
		let diffs = self.read_diffs_from(start_line)?;
		Ok(apply_diffs_sequential(base, &diffs))
	}

	/// Number of diff records at or after `start_line`. A missing log
	/// counts as empty.
	#[must_use]
	pub fn len_since(&self, start_line: usize) -> usize {
		let Ok(content) = std::fs::read_to_string(&self.path) else {
			return 0;
		};
		content.lines().skip(start_line).count()
	}

	/// Replaces the whole log so it reproduces `text`.
	///
	/// A non-empty snapshot becomes a single insert-from-empty diff; an
	/// empty one truncates the log to nothing.
	pub fn install_snapshot(&self, text: &str) -> std::io::Result<()> {
		self.ensure_exists()?;
		std::fs::write(&self.path, "")?;
		self.append("", text).map(drop)
	}

	/// Whole-file read of the serialized log, for snapshot transfer.
	pub fn read_raw(&self) -> std::io::Result<String> {
		self.ensure_exists()?;
		std::fs::read_to_string(&self.path)
	}
}

//! Locations of a site's persistent files.

use std::path::{Path, PathBuf};

/// Path of the append-only diff log for `filename` under `output_dir`.
#[must_use]
pub fn log_path(output_dir: &Path, filename: &str) -> PathBuf {
	output_dir.join(format!("{filename}.log"))
}

/// Path of the cut snapshot store under `output_dir`.
#[must_use]
pub fn cut_path(output_dir: &Path) -> PathBuf {
	output_dir.join("cut.json")
}

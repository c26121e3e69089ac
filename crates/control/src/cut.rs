//! Persistent store for cut snapshots.
//!
//! `cut.json` maps a cut id to the vector clocks recorded for it, keyed
//! by `site_<id>_action_<n>`. Updates are read-modify-write; the file is
//! only touched from the controller's event loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use quill_proto::VectorClock;

/// In-memory shape of the cut file.
pub type CutFile = BTreeMap<String, BTreeMap<String, VectorClock>>;

/// Handle on a site's `cut.json`.
#[derive(Debug, Clone)]
pub struct CutStore {
	path: PathBuf,
}

impl CutStore {
	/// Creates a handle; the file appears on first record.
	#[must_use]
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// The store location.
	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Reads the whole store; a missing file is an empty store.
	pub fn load(&self) -> std::io::Result<CutFile> {
		match std::fs::read_to_string(&self.path) {
			Ok(content) => serde_json::from_str(&content)
				.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CutFile::new()),
			Err(e) => Err(e),
		}
	}

	/// Allocates the next unused `cut_number_<N>` id.
	#[must_use]
	pub fn next_cut_id(&self) -> String {
		let max = self
			.load()
			.unwrap_or_default()
			.keys()
			.filter_map(|key| key.strip_prefix("cut_number_"))
			.filter_map(|n| n.parse::<u64>().ok())
			.max();
		format!("cut_number_{}", max.map_or(1, |n| n + 1))
	}

	/// Records `clock` under `(cut_id, site_action)` and writes the store
	/// back out.
	pub fn record(
		&self,
		cut_id: &str,
		site_action: &str,
		clock: &VectorClock,
	) -> std::io::Result<()> {
		let mut cuts = self.load()?;
		cuts.entry(cut_id.to_owned())
			.or_default()
			.insert(site_action.to_owned(), clock.clone());

		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			std::fs::create_dir_all(parent)?;
		}
		let json = serde_json::to_string_pretty(&cuts)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
		std::fs::write(&self.path, json)
	}
}

#[cfg(test)]
mod tests {
	use quill_proto::SiteId;

	use super::*;

	#[test]
	fn record_and_load_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let store = CutStore::new(dir.path().join("cut.json"));

		let mut clock = VectorClock::new();
		clock.tick(&SiteId::from("a"));
		store.record("cut_number_1", "site_a_action_3", &clock).unwrap();

		let cuts = store.load().unwrap();
		assert_eq!(cuts["cut_number_1"]["site_a_action_3"], clock);
	}

	#[test]
	fn ids_advance_past_the_highest_recorded() {
		let dir = tempfile::tempdir().unwrap();
		let store = CutStore::new(dir.path().join("cut.json"));

		assert_eq!(store.next_cut_id(), "cut_number_1");

		store
			.record("cut_number_4", "site_a_action_1", &VectorClock::new())
			.unwrap();
		assert_eq!(store.next_cut_id(), "cut_number_5");
	}

	#[test]
	fn records_merge_instead_of_clobbering() {
		let dir = tempfile::tempdir().unwrap();
		let store = CutStore::new(dir.path().join("cut.json"));

		store
			.record("cut_number_1", "site_a_action_1", &VectorClock::new())
			.unwrap();
		store
			.record("cut_number_1", "site_b_action_2", &VectorClock::new())
			.unwrap();

		let cuts = store.load().unwrap();
		assert_eq!(cuts["cut_number_1"].len(), 2);
	}
}

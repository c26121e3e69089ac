//! Controller-owned state: phase and the per-peer state map.

use std::collections::BTreeMap;

use quill_proto::{SiteId, Stamp};

/// The controller's position in the mutual-exclusion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// Not interested in the critical section.
	Idle,
	/// A request is outstanding.
	Requesting,
	/// The editor holds the critical section.
	InCs,
}

/// The last message kind observed from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
	/// The peer wants the critical section.
	Request,
	/// The peer acknowledged somebody's request.
	Receipt,
	/// The peer released the critical section.
	Release,
}

/// Last known `(kind, stamp)` for one peer.
///
/// `stamp: None` marks a member that has never stamped a message; such
/// an entry loses every priority comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
	/// Kind of the last observed message.
	pub kind: PeerKind,
	/// Stamp of the last observed message, absent for fresh members.
	pub stamp: Option<Stamp>,
}

impl PeerEntry {
	/// Entry for a member nothing has been heard from yet.
	#[must_use]
	pub fn sentinel() -> Self {
		Self {
			kind: PeerKind::Release,
			stamp: None,
		}
	}
}

/// Map from known site id to its last observed state.
///
/// The local site appears in its own map; grant checks skip it when
/// iterating opponents.
#[derive(Debug, Clone, Default)]
pub struct StateMap(BTreeMap<SiteId, PeerEntry>);

impl StateMap {
	/// Map containing only the local site's sentinel entry.
	#[must_use]
	pub fn with_self(site: &SiteId) -> Self {
		let mut map = BTreeMap::new();
		map.insert(site.clone(), PeerEntry::sentinel());
		Self(map)
	}

	/// Records an observation for `site`, creating the entry on demand.
	pub fn observe(&mut self, site: &SiteId, kind: PeerKind, stamp: Stamp) {
		self.0.insert(
			site.clone(),
			PeerEntry {
				kind,
				stamp: Some(stamp),
			},
		);
	}

	/// Inserts a sentinel entry for `site` unless it is already known.
	pub fn admit(&mut self, site: &SiteId) {
		self.0.entry(site.clone()).or_insert_with(PeerEntry::sentinel);
	}

	/// Drops `site` from the map.
	pub fn remove(&mut self, site: &SiteId) {
		self.0.remove(site);
	}

	/// Looks up a peer's entry.
	#[must_use]
	pub fn get(&self, site: &SiteId) -> Option<&PeerEntry> {
		self.0.get(site)
	}

	/// True when `site` is a known member.
	#[must_use]
	pub fn contains(&self, site: &SiteId) -> bool {
		self.0.contains_key(site)
	}

	/// Number of known members, the local site included.
	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// True when even the local site is gone.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// All known member ids in lexicographic order.
	#[must_use]
	pub fn members(&self) -> Vec<SiteId> {
		self.0.keys().cloned().collect()
	}

	/// Iterates entries in id order.
	pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &PeerEntry)> {
		self.0.iter()
	}
}

//! The mutual-exclusion state machine.

use std::collections::HashSet;

use quill_proto::{Diff, Message, SiteId, Stamp, VectorClock};
use tracing::{debug, warn};

use crate::cut::CutStore;
use crate::state::{PeerKind, Phase, StateMap};

/// One message for the controller to consume.
#[derive(Debug, Clone)]
pub enum Inbound {
	/// A line from the local editor.
	Editor(Message),
	/// A wave-delivered payload from a peer controller.
	Peer(Message),
	/// The network layer saw an access request from a candidate.
	Access {
		/// The dialing site.
		candidate: SiteId,
		/// True when this site has no other admitted peer, so the
		/// candidate can be let in without a mutual-exclusion round.
		solo: bool,
	},
	/// Member list learned from the peer that admitted us.
	Members(Vec<SiteId>),
}

/// A message the controller wants sent.
#[derive(Debug, Clone)]
pub enum Outbound {
	/// Write this line to the local editor.
	Editor(Message),
	/// Wave-broadcast this controller message to the group.
	Broadcast {
		/// The payload to diffuse.
		message: Message,
		/// True when this is the site's parting release; once its wave
		/// terminates the site may shut down.
		closing: bool,
	},
	/// Complete a pending admission handshake with a snapshot.
	Grant {
		/// The admitted site.
		candidate: SiteId,
		/// Every member this site knows, itself included.
		known: Vec<SiteId>,
		/// Current committed text for the newcomer's replica.
		snapshot: String,
	},
}

/// The per-site controller state machine.
///
/// All fields are owned here and only mutated through
/// [`Controller::handle`]; the surrounding runtime must feed it one
/// message at a time.
#[derive(Debug)]
pub struct Controller {
	site: SiteId,
	stamp: Stamp,
	clock: VectorClock,
	peers: StateMap,
	phase: Phase,
	admissions: Vec<SiteId>,
	awaiting_snapshot: Vec<SiteId>,
	pending_close: bool,
	actions: u64,
	cuts: CutStore,
	seen_cuts: HashSet<String>,
}

impl Controller {
	/// Creates a controller for `site`, persisting cuts through `cuts`.
	#[must_use]
	pub fn new(site: SiteId, cuts: CutStore) -> Self {
		Self {
			peers: StateMap::with_self(&site),
			site,
			stamp: 0,
			clock: VectorClock::new(),
			phase: Phase::Idle,
			admissions: Vec::new(),
			awaiting_snapshot: Vec::new(),
			pending_close: false,
			actions: 0,
			cuts,
			seen_cuts: HashSet::new(),
		}
	}

	/// The local site id.
	#[must_use]
	pub fn site(&self) -> &SiteId {
		&self.site
	}

	/// Current phase in the mutual-exclusion cycle.
	#[must_use]
	pub fn phase(&self) -> Phase {
		self.phase
	}

	/// Current Lamport stamp.
	#[must_use]
	pub fn stamp(&self) -> Stamp {
		self.stamp
	}

	/// Current vector clock.
	#[must_use]
	pub fn clock(&self) -> &VectorClock {
		&self.clock
	}

	/// Known members, the local site included.
	#[must_use]
	pub fn members(&self) -> Vec<SiteId> {
		self.peers.members()
	}

	/// Consumes one inbound message and returns what to send.
	pub fn handle(&mut self, inbound: Inbound) -> Vec<Outbound> {
		match inbound {
			Inbound::Editor(msg) => self.on_editor(msg),
			Inbound::Peer(msg) => self.on_peer(msg),
			Inbound::Access { candidate, solo } => self.on_access(candidate, solo),
			Inbound::Members(list) => {
				for member in &list {
					self.peers.admit(member);
				}
				debug!(site = %self.site, members = self.peers.len(), "member list installed");
				Vec::new()
			}
		}
	}

	fn on_editor(&mut self, msg: Message) -> Vec<Outbound> {
		match msg {
			Message::AppRequest => {
				if self.phase == Phase::Requesting {
					debug!(site = %self.site, "editor request while already requesting");
					return Vec::new();
				}
				self.request_cs()
			}
			Message::AppRelease { diffs } => {
				if self.phase != Phase::InCs {
					warn!(site = %self.site, "editor release outside the critical section");
					return Vec::new();
				}
				self.release_cs(diffs)
			}
			Message::AppDied => {
				self.pending_close = true;
				match self.phase {
					// The parting release needs the token first.
					Phase::Idle => self.request_cs(),
					// Already inside: release on the editor's behalf.
					Phase::InCs => self.release_cs(Vec::new()),
					Phase::Requesting => Vec::new(),
				}
			}
			Message::Cut { cut_id, .. } => self.originate_cut(cut_id),
			Message::SharedText {
				candidate,
				text: Some(text),
			} => self.complete_grant(&candidate, text),
			Message::InitialSize { lines } => {
				debug!(site = %self.site, lines, "editor announced its log length");
				Vec::new()
			}
			Message::InitialText { text } => {
				debug!(site = %self.site, chars = text.chars().count(), "editor announced its text");
				Vec::new()
			}
			other => {
				warn!(site = %self.site, kind = other.kind(), "unexpected editor message dropped");
				Vec::new()
			}
		}
	}

	fn on_peer(&mut self, msg: Message) -> Vec<Outbound> {
		match msg {
			Message::Request { site, stamp, clock } => {
				if site == self.site {
					return Vec::new();
				}
				self.absorb(stamp, Some(&clock));
				self.peers.observe(&site, PeerKind::Request, stamp);

				let receipt = Message::Receipt {
					site: self.site.clone(),
					dest: site,
					stamp: self.stamp,
					clock: self.clock.clone(),
				};
				self.actions += 1;
				let mut out = vec![Outbound::Broadcast {
					message: receipt,
					closing: false,
				}];
				out.extend(self.maybe_grant());
				out
			}
			Message::Receipt {
				site, dest, stamp, clock,
			} => {
				// Receipts are addressed; everyone else only forwards.
				if dest != self.site || site == self.site {
					return Vec::new();
				}
				self.absorb(stamp, Some(&clock));
				if self.peers.get(&site).map(|e| e.kind) != Some(PeerKind::Request) {
					self.peers.observe(&site, PeerKind::Receipt, stamp);
				}
				self.maybe_grant()
			}
			Message::Release {
				site,
				stamp,
				clock,
				diffs,
				admit,
				closing,
			} => {
				if site == self.site {
					return Vec::new();
				}
				self.absorb(stamp, Some(&clock));
				self.peers.observe(&site, PeerKind::Release, stamp);
				for candidate in &admit {
					self.peers.admit(candidate);
				}
				if closing {
					self.peers.remove(&site);
				}

				self.actions += 1;
				let mut out = vec![Outbound::Editor(Message::ApplyUpdate { diffs })];
				out.extend(self.maybe_grant());
				out
			}
			Message::Cut {
				cut_id: Some(cut_id),
				hops,
				site: _,
				clock: Some(clock),
			} => self.on_peer_cut(cut_id, hops, &clock),
			Message::Cut { .. } => {
				warn!(site = %self.site, "cut marker without id or clock dropped");
				Vec::new()
			}
			other => {
				warn!(site = %self.site, kind = other.kind(), "unexpected peer message dropped");
				Vec::new()
			}
		}
	}

	fn on_access(&mut self, candidate: SiteId, solo: bool) -> Vec<Outbound> {
		if solo {
			// Nobody to coordinate with: admit directly, fetch the
			// snapshot from the editor and finish the handshake on reply.
			self.peers.admit(&candidate);
			self.awaiting_snapshot.push(candidate.clone());
			self.actions += 1;
			return vec![Outbound::Editor(Message::SharedText {
				candidate,
				text: None,
			})];
		}

		if !self.admissions.contains(&candidate) {
			self.admissions.push(candidate);
		}
		// The candidate is bundled on our next release; make sure one
		// happens even if the editor has nothing to commit.
		if self.phase == Phase::Idle && !self.pending_close {
			self.request_cs()
		} else {
			Vec::new()
		}
	}

	/// Lamport/vector bookkeeping for one stamped peer message.
	fn absorb(&mut self, stamp: Stamp, clock: Option<&VectorClock>) {
		self.stamp = self.stamp.max(stamp) + 1;
		if let Some(remote) = clock {
			self.clock.merge(remote);
		}
		self.clock.tick(&self.site);
		self.actions += 1;
	}

	/// Local action bookkeeping for a self-originated message.
	fn advance_local(&mut self) {
		self.stamp += 1;
		self.clock.tick(&self.site);
		self.actions += 1;
	}

	fn request_cs(&mut self) -> Vec<Outbound> {
		self.advance_local();
		self.peers.observe(&self.site, PeerKind::Request, self.stamp);
		self.phase = Phase::Requesting;
		debug!(site = %self.site, stamp = self.stamp, "requesting the critical section");

		self.actions += 1;
		let mut out = vec![Outbound::Broadcast {
			message: Message::Request {
				site: self.site.clone(),
				stamp: self.stamp,
				clock: self.clock.clone(),
			},
			closing: false,
		}];
		// A site alone in the group (or among fresh members only) wins
		// its own request immediately.
		out.extend(self.maybe_grant());
		out
	}

	fn release_cs(&mut self, diffs: Vec<Diff>) -> Vec<Outbound> {
		self.advance_local();
		self.peers.observe(&self.site, PeerKind::Release, self.stamp);
		self.phase = Phase::Idle;

		let admit = std::mem::take(&mut self.admissions);
		for candidate in &admit {
			self.peers.admit(candidate);
		}

		let closing = self.pending_close;
		if closing {
			self.peers.remove(&self.site);
		}
		debug!(site = %self.site, admitted = admit.len(), closing, "releasing the critical section");

		self.actions += 1;
		let mut out = vec![Outbound::Broadcast {
			message: Message::Release {
				site: self.site.clone(),
				stamp: self.stamp,
				clock: self.clock.clone(),
				diffs,
				admit: admit.clone(),
				closing,
			},
			closing,
		}];

		if !closing {
			// Each admitted candidate still needs a snapshot before its
			// handshake can complete.
			for candidate in admit {
				self.awaiting_snapshot.push(candidate.clone());
				self.actions += 1;
				out.push(Outbound::Editor(Message::SharedText {
					candidate,
					text: None,
				}));
			}
		}
		out
	}

	fn maybe_grant(&mut self) -> Vec<Outbound> {
		if self.phase != Phase::Requesting {
			return Vec::new();
		}
		let Some(mine) = self.peers.get(&self.site) else {
			return Vec::new();
		};
		if mine.kind != PeerKind::Request {
			return Vec::new();
		}
		let Some(my_stamp) = mine.stamp else {
			return Vec::new();
		};

		for (id, peer) in self.peers.iter() {
			if id == &self.site {
				continue;
			}
			// Fresh members without a stamp never block.
			let Some(peer_stamp) = peer.stamp else {
				continue;
			};
			if (my_stamp, &self.site) >= (peer_stamp, id) {
				return Vec::new();
			}
		}

		if self.pending_close {
			// The editor is gone; the token was only needed for the
			// parting release.
			return self.release_cs(Vec::new());
		}

		self.phase = Phase::InCs;
		self.actions += 1;
		debug!(site = %self.site, "entering the critical section");
		vec![Outbound::Editor(Message::StartCs)]
	}

	fn complete_grant(&mut self, candidate: &SiteId, snapshot: String) -> Vec<Outbound> {
		let Some(idx) = self.awaiting_snapshot.iter().position(|c| c == candidate) else {
			warn!(site = %self.site, candidate = %candidate, "snapshot for unknown candidate dropped");
			return Vec::new();
		};
		self.awaiting_snapshot.remove(idx);
		self.actions += 1;
		vec![Outbound::Grant {
			candidate: candidate.clone(),
			known: self.peers.members(),
			snapshot,
		}]
	}

	fn originate_cut(&mut self, cut_id: Option<String>) -> Vec<Outbound> {
		let cut_id = cut_id.unwrap_or_else(|| self.cuts.next_cut_id());
		if self.seen_cuts.contains(&cut_id) {
			debug!(site = %self.site, cut = %cut_id, "cut already recorded");
			return Vec::new();
		}
		self.advance_local();
		self.record_cut(&cut_id);

		self.actions += 1;
		vec![Outbound::Broadcast {
			message: Message::Cut {
				cut_id: Some(cut_id),
				hops: 1,
				site: Some(self.site.clone()),
				clock: Some(self.clock.clone()),
			},
			closing: false,
		}]
	}

	fn on_peer_cut(&mut self, cut_id: String, hops: u64, remote: &VectorClock) -> Vec<Outbound> {
		if self.seen_cuts.contains(&cut_id) {
			return Vec::new();
		}
		self.stamp += 1;
		self.clock.merge(remote);
		self.clock.tick(&self.site);
		self.actions += 1;
		self.record_cut(&cut_id);

		// The marker dies once it has covered the whole membership.
		if hops >= self.peers.len() as u64 {
			return Vec::new();
		}
		self.actions += 1;
		vec![Outbound::Broadcast {
			message: Message::Cut {
				cut_id: Some(cut_id),
				hops: hops + 1,
				site: Some(self.site.clone()),
				clock: Some(self.clock.clone()),
			},
			closing: false,
		}]
	}

	fn record_cut(&mut self, cut_id: &str) {
		self.seen_cuts.insert(cut_id.to_owned());
		let key = format!("site_{}_action_{}", self.site, self.actions);
		if let Err(error) = self.cuts.record(cut_id, &key, &self.clock) {
			warn!(site = %self.site, cut = %cut_id, %error, "failed to persist cut record");
		}
	}
}

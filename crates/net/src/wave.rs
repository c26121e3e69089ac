//! The wave (propagation of information with feedback) broadcast.
//!
//! Every controller-originated message travels as a blue line flooding
//! the overlay; red lines flow back towards the originator once a
//! subtree has seen the payload. Each site delivers a given wave's
//! payload exactly once, and the originator observes termination when
//! its own counter reaches zero.

use std::collections::{HashMap, HashSet};

use quill_proto::{Colour, Envelope, SiteId, WaveId};
use tracing::warn;

/// Bookkeeping for one active wave at this site.
#[derive(Debug)]
struct DiffusionStatus {
	/// Peer the first blue line came from; `None` when we originated.
	parent: Option<SiteId>,
	/// Red lines still expected before this site reports back.
	remaining: usize,
}

/// What the transport should do after a wave step.
#[derive(Debug, PartialEq)]
pub(crate) enum WaveAction {
	/// Send `line` to the named admitted peer.
	Forward {
		/// Recipient peer.
		to: SiteId,
		/// Encoded envelope line.
		line: String,
	},
	/// Hand the payload to the controller.
	Deliver(String),
	/// A wave this site originated has terminated.
	Done(WaveId),
}

/// Per-site wave state: active statuses plus the set of waves ever seen.
#[derive(Debug)]
pub(crate) struct WaveTable {
	site: SiteId,
	statuses: HashMap<WaveId, DiffusionStatus>,
	seen: HashSet<WaveId>,
	counter: u64,
}

impl WaveTable {
	pub(crate) fn new(site: SiteId) -> Self {
		Self {
			site,
			statuses: HashMap::new(),
			seen: HashSet::new(),
			counter: 0,
		}
	}

	fn blue_line(&self, wave: &WaveId, payload: &str) -> String {
		Envelope {
			wave: wave.clone(),
			colour: Colour::Blue,
			forwarder: self.site.clone(),
			payload: Some(payload.to_owned()),
		}
		.encode()
	}

	fn red_line(&self, wave: &WaveId) -> String {
		Envelope {
			wave: wave.clone(),
			colour: Colour::Red,
			forwarder: self.site.clone(),
			payload: None,
		}
		.encode()
	}

	/// Starts a wave for `payload` towards the given admitted peers.
	///
	/// With no peers the wave terminates on the spot.
	pub(crate) fn originate(&mut self, payload: &str, peers: &[SiteId]) -> (WaveId, Vec<WaveAction>) {
		self.counter += 1;
		let wave = WaveId {
			origin: self.site.clone(),
			counter: self.counter,
		};
		self.seen.insert(wave.clone());

		if peers.is_empty() {
			return (wave.clone(), vec![WaveAction::Done(wave)]);
		}

		let line = self.blue_line(&wave, payload);
		self.statuses.insert(
			wave.clone(),
			DiffusionStatus {
				parent: None,
				remaining: peers.len(),
			},
		);
		let actions = peers
			.iter()
			.map(|to| WaveAction::Forward {
				to: to.clone(),
				line: line.clone(),
			})
			.collect();
		(wave, actions)
	}

	/// Handles an incoming blue line.
	///
	/// First sight delivers the payload and floods every admitted peer
	/// except the forwarder; a duplicate answers red immediately.
	pub(crate) fn on_blue(
		&mut self,
		wave: WaveId,
		forwarder: SiteId,
		payload: String,
		peers: &[SiteId],
	) -> Vec<WaveAction> {
		if self.seen.contains(&wave) {
			return vec![WaveAction::Forward {
				to: forwarder,
				line: self.red_line(&wave),
			}];
		}
		self.seen.insert(wave.clone());

		let mut actions = vec![WaveAction::Deliver(payload.clone())];
		let targets: Vec<&SiteId> = peers.iter().filter(|p| **p != forwarder).collect();

		if targets.is_empty() {
			actions.push(WaveAction::Forward {
				to: forwarder,
				line: self.red_line(&wave),
			});
			return actions;
		}

		let line = self.blue_line(&wave, &payload);
		self.statuses.insert(
			wave,
			DiffusionStatus {
				parent: Some(forwarder),
				remaining: targets.len(),
			},
		);
		actions.extend(targets.into_iter().map(|to| WaveAction::Forward {
			to: to.clone(),
			line: line.clone(),
		}));
		actions
	}

	/// Handles an incoming red line.
	pub(crate) fn on_red(&mut self, wave: WaveId) -> Vec<WaveAction> {
		let Some(status) = self.statuses.get_mut(&wave) else {
			warn!(site = %self.site, wave = %wave, "red line for an unknown wave dropped");
			return Vec::new();
		};
		status.remaining -= 1;
		if status.remaining > 0 {
			return Vec::new();
		}

		let parent = status.parent.take();
		self.statuses.remove(&wave);
		match parent {
			None => vec![WaveAction::Done(wave)],
			Some(parent) => vec![WaveAction::Forward {
				to: parent,
				line: self.red_line(&wave),
			}],
		}
	}
}

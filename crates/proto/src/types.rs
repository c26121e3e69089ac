//! Core identifier and payload types carried on the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique site identifier.
///
/// Site ids are opaque strings ordered lexicographically; that order is
/// the tiebreaker for equal Lamport stamps, so two sites must never share
/// an id. [`SiteId::generate`] derives one from the current time plus a
/// per-process nonce.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl SiteId {
	/// Derives a fresh site id from a high-resolution timestamp and a nonce.
	#[must_use]
	pub fn generate() -> Self {
		use std::sync::atomic::{AtomicU64, Ordering};
		static NONCE: AtomicU64 = AtomicU64::new(0);

		let nanos = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_nanos())
			.unwrap_or(0);
		let nonce = NONCE.fetch_add(1, Ordering::Relaxed) ^ u64::from(std::process::id());
		Self(format!("{nanos:x}-{:04x}", nonce & 0xffff))
	}

	/// Returns the id as a string slice.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SiteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SiteId {
	fn from(s: &str) -> Self {
		Self(s.to_owned())
	}
}

/// Scalar Lamport stamp used to order critical-section requests.
pub type Stamp = u64;

/// Per-site vector clock: site id to action counter.
///
/// The local entry is incremented on every logical action; on receipt of
/// a remote clock the local one is merged componentwise before the local
/// entry ticks. New site ids appear on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(pub BTreeMap<SiteId, u64>);

impl VectorClock {
	/// Creates an empty clock.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Componentwise maximum with a remote clock.
	pub fn merge(&mut self, remote: &VectorClock) {
		for (site, &n) in &remote.0 {
			let entry = self.0.entry(site.clone()).or_insert(0);
			if *entry < n {
				*entry = n;
			}
		}
	}

	/// Increments the local site's entry.
	pub fn tick(&mut self, site: &SiteId) {
		*self.0.entry(site.clone()).or_insert(0) += 1;
	}

	/// Returns the counter recorded for `site`, zero when absent.
	#[must_use]
	pub fn get(&self, site: &SiteId) -> u64 {
		self.0.get(site).copied().unwrap_or(0)
	}
}

/// One edit operation over a codepoint sequence.
///
/// `pos` indexes codepoints in the text the diff was computed against;
/// `nb_deleted` codepoints are removed there and `new_text` inserted in
/// their place. Serialized as one JSON object per diff-log line with the
/// historical field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
	/// Start index, in codepoints.
	#[serde(rename = "Pos")]
	pub pos: usize,
	/// Number of codepoints to delete at `pos`.
	#[serde(rename = "NbDeleted")]
	pub nb_deleted: usize,
	/// Text to insert at `pos`.
	#[serde(rename = "NewText")]
	pub new_text: String,
}

impl Diff {
	/// Convenience constructor.
	#[must_use]
	pub fn new(pos: usize, nb_deleted: usize, new_text: impl Into<String>) -> Self {
		Self {
			pos,
			nb_deleted,
			new_text: new_text.into(),
		}
	}
}

/// Identifier of one wave broadcast: the originating site plus a local
/// counter, unique as long as site ids are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaveId {
	/// Site that originated the wave.
	pub origin: SiteId,
	/// Originator-local sequence number.
	pub counter: u64,
}

impl fmt::Display for WaveId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.origin, self.counter)
	}
}

impl WaveId {
	/// Parses the `origin#counter` wire form.
	#[must_use]
	pub fn parse(s: &str) -> Option<Self> {
		let (origin, counter) = s.rsplit_once('#')?;
		Some(Self {
			origin: SiteId::from(origin),
			counter: counter.parse().ok()?,
		})
	}
}

/// Wave message colour: blue travels outward, red is the feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colour {
	/// Outward propagation carrying the payload.
	Blue,
	/// Inward acknowledgement.
	Red,
}

impl Colour {
	/// Wire tag for this colour.
	#[must_use]
	pub fn tag(self) -> &'static str {
		match self {
			Self::Blue => "blu",
			Self::Red => "red",
		}
	}

	/// Parses a wire tag.
	#[must_use]
	pub fn from_tag(tag: &str) -> Option<Self> {
		match tag {
			"blu" => Some(Self::Blue),
			"red" => Some(Self::Red),
			_ => None,
		}
	}
}

/// Every message kind exchanged between editor, controller, and peers.
///
/// Peer-to-peer controller messages ([`Message::Request`],
/// [`Message::Receipt`], [`Message::Release`], [`Message::Cut`]) travel
/// as wave payloads; the remaining variants cross the editor/controller
/// stdio boundary or the peer handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	/// A site asks for the critical section.
	Request {
		/// Requesting site.
		site: SiteId,
		/// Stamp of the request.
		stamp: Stamp,
		/// Sender's vector clock at send time.
		clock: VectorClock,
	},
	/// Acknowledgement of a request, addressed to one site.
	Receipt {
		/// Acknowledging site.
		site: SiteId,
		/// Site the receipt is addressed to.
		dest: SiteId,
		/// Stamp of the receipt.
		stamp: Stamp,
		/// Sender's vector clock at send time.
		clock: VectorClock,
	},
	/// A site leaves the critical section, publishing its edits.
	Release {
		/// Releasing site.
		site: SiteId,
		/// Stamp of the release.
		stamp: Stamp,
		/// Sender's vector clock at send time.
		clock: VectorClock,
		/// Edits committed during the critical section.
		diffs: Vec<Diff>,
		/// Candidates admitted atomically with this release.
		admit: Vec<SiteId>,
		/// True when the sender is leaving the group.
		closing: bool,
	},
	/// Snapshot marker collecting vector clocks along the group.
	Cut {
		/// Cut identifier (`cut_number_<N>`); absent on the editor's
		/// manual trigger, allocated by the controller.
		cut_id: Option<String>,
		/// Number of hops the marker has travelled.
		hops: u64,
		/// Forwarding site; absent on the editor's manual trigger.
		site: Option<SiteId>,
		/// Forwarder's vector clock; absent on the editor's manual trigger.
		clock: Option<VectorClock>,
	},
	/// Editor asks for the critical section.
	AppRequest,
	/// Editor releases the critical section with its committed diffs.
	AppRelease {
		/// Edits since the last committed text.
		diffs: Vec<Diff>,
	},
	/// Editor process is exiting.
	AppDied,
	/// Controller grants the critical section to the editor.
	StartCs,
	/// Controller forwards a remote site's committed diffs.
	ApplyUpdate {
		/// Edits to apply to the committed text.
		diffs: Vec<Diff>,
	},
	/// Controller orders the editor to exit.
	Shutdown,
	/// Snapshot exchange for an admission candidate.
	///
	/// Controller to editor: `text` absent, asking for the current
	/// committed text. Editor to controller: `text` carries it.
	SharedText {
		/// Candidate the snapshot is destined for.
		candidate: SiteId,
		/// The committed text, newline-escaped on the wire.
		text: Option<String>,
	},
	/// Editor announces its diff-log length at startup.
	InitialSize {
		/// Number of diff lines in the local log.
		lines: u64,
	},
	/// Editor announces its committed text at startup.
	InitialText {
		/// Committed text, newline-escaped on the wire.
		text: String,
	},
	/// Controller installs a snapshot in the editor's replica.
	ReturnText {
		/// Snapshot text, newline-escaped on the wire.
		text: String,
	},
	/// Handshake: a dialing site asks to join through this peer.
	AccessRequest {
		/// The dialing site.
		site: SiteId,
	},
	/// Handshake: the peer admits the dialer.
	AccessGranted {
		/// The granting site.
		site: SiteId,
		/// Every member the granter knows about.
		known: Vec<SiteId>,
		/// Document snapshot for first-time joiners.
		snapshot: Option<String>,
	},
}

/// A wave (PIF) envelope around a peer line.
///
/// Blue envelopes append their routing fields after the payload's own
/// fields, so the payload stays parseable in place; red envelopes carry
/// no payload and use the `dif` kind tag of their own.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
	/// Wave this line belongs to.
	pub wave: WaveId,
	/// Propagation direction.
	pub colour: Colour,
	/// Peer that forwarded this line.
	pub forwarder: SiteId,
	/// Encoded controller message; present on blue lines only.
	pub payload: Option<String>,
}

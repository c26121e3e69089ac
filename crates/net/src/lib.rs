//! The overlay network layer.
//!
//! # Mental model
//!
//! - Sites form an arbitrary connected undirected graph over TCP; each
//!   edge carries newline-framed wire lines in both directions.
//! - Every controller message travels inside a wave envelope: blue lines
//!   flood outward along the overlay, red lines fold back towards the
//!   originator. The network layer owns wave routing; it hands each
//!   payload to the controller exactly once and reports termination of
//!   locally originated waves.
//! - A newcomer dials its bootstrap targets and sends an access request.
//!   The receiver either grants on the spot (it is alone, or it already
//!   knows the dialer) or parks the connection and asks its controller
//!   to admit the candidate at the next release boundary.
//! - The peer maps (admitted, pending, waiting) sit behind one mutex.
//!   Sends are queue pushes and never await, so no lock is ever held
//!   across a suspension point.
//! - A broken established link removes the peer from the admitted map
//!   with a warning; membership is the controller's business and is not
//!   touched from here.
//!
//! # Tasks
//!
//! One accept loop, one dial task per bootstrap target, one reader task
//! and one writer task per link. Everything observes the shared
//! [`CancellationToken`].

#![warn(missing_docs)]

mod peer;
mod wave;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quill_proto::{Colour, Envelope, Message, SiteId, WaveId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::peer::{PeerHandle, PeerMaps, spawn_writer};
use crate::wave::{WaveAction, WaveTable};

/// Attempts made to reach one bootstrap target before giving up.
const CONNECT_RETRY_LIMIT: u32 = 30;
/// Pause between bootstrap connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Startup parameters for the network layer.
#[derive(Debug, Clone)]
pub struct NetConfig {
	/// The local site id.
	pub site: SiteId,
	/// TCP port to listen on; 0 lets the OS pick.
	pub listen_port: u16,
	/// `host:port` targets dialed at startup to join an existing group.
	pub bootstrap: Vec<String>,
}

/// Something the network layer wants the site runtime to know.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
	/// A wave payload for the controller, exactly once per wave.
	Deliver(String),
	/// A candidate asked to join through us.
	Access {
		/// The dialing site.
		candidate: SiteId,
		/// True when this site has no admitted peer, so the candidate
		/// can be granted without a mutual-exclusion round.
		solo: bool,
	},
	/// We were admitted by `via`.
	Joined {
		/// The peer that granted access.
		via: SiteId,
		/// Members it told us about.
		known: Vec<SiteId>,
		/// Document snapshot for a first join; absent on reconnection.
		snapshot: Option<String>,
	},
	/// A wave this site originated has terminated.
	WaveDone(WaveId),
}

struct NetworkInner {
	site: SiteId,
	local_addr: SocketAddr,
	peers: Mutex<PeerMaps>,
	waves: Mutex<WaveTable>,
	events: mpsc::UnboundedSender<NetEvent>,
	shutdown: CancellationToken,
}

/// Handle on the running network layer.
#[derive(Clone)]
pub struct Network {
	inner: Arc<NetworkInner>,
}

impl Network {
	/// Binds the listener, starts the accept loop and the bootstrap
	/// dialers. Failing to bind is fatal and surfaces here.
	pub async fn start(
		config: NetConfig,
		events: mpsc::UnboundedSender<NetEvent>,
		shutdown: CancellationToken,
	) -> std::io::Result<Self> {
		let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
		let local_addr = listener.local_addr()?;
		info!(site = %config.site, addr = %local_addr, "listening for peers");

		let inner = Arc::new(NetworkInner {
			waves: Mutex::new(WaveTable::new(config.site.clone())),
			site: config.site,
			local_addr,
			peers: Mutex::new(PeerMaps::default()),
			events,
			shutdown,
		});

		tokio::spawn(accept_loop(inner.clone(), listener));
		for target in config.bootstrap {
			tokio::spawn(dial(inner.clone(), target));
		}

		Ok(Self { inner })
	}

	/// The bound listen address.
	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.inner.local_addr
	}

	/// Currently admitted peers.
	#[must_use]
	pub fn admitted(&self) -> Vec<SiteId> {
		self.inner.peers.lock().unwrap().admitted_ids()
	}

	/// Starts a wave carrying `payload` to every admitted peer.
	///
	/// Returns the wave id; a [`NetEvent::WaveDone`] for it arrives once
	/// every peer has acknowledged (immediately when there are none).
	pub fn broadcast(&self, payload: &str) -> WaveId {
		let peers = self.inner.peers.lock().unwrap().admitted_ids();
		let (wave, actions) = self.inner.waves.lock().unwrap().originate(payload, &peers);
		debug!(site = %self.inner.site, wave = %wave, peers = peers.len(), "wave started");
		self.inner.run_actions(actions);
		wave
	}

	/// Completes a pending admission: sends the grant line and moves the
	/// candidate into the admitted map.
	pub fn grant(&self, candidate: &SiteId, known: Vec<SiteId>, snapshot: String) {
		let mut peers = self.inner.peers.lock().unwrap();
		let Some(handle) = peers.waiting.remove(candidate) else {
			warn!(site = %self.inner.site, candidate = %candidate, "grant for a candidate that is not waiting");
			return;
		};
		// The grant line must enter the writer queue before any wave
		// line can, so the candidate always sees it first.
		let line = Message::AccessGranted {
			site: self.inner.site.clone(),
			known,
			snapshot: Some(snapshot),
		}
		.encode();
		if handle.send(line) {
			peers.admit(candidate.clone(), handle);
			info!(site = %self.inner.site, candidate = %candidate, "candidate admitted");
		} else {
			warn!(site = %self.inner.site, candidate = %candidate, "candidate vanished before its grant");
		}
	}
}

impl NetworkInner {
	fn emit(&self, event: NetEvent) {
		let _ = self.events.send(event);
	}

	fn send_to(&self, to: &SiteId, line: String) {
		let handle = self.peers.lock().unwrap().admitted.get(to).cloned();
		match handle {
			Some(handle) if handle.send(line) => {}
			Some(_) => self.drop_peer(to),
			None => debug!(site = %self.site, peer = %to, "no link for outbound line"),
		}
	}

	/// Removes a dead link. The peer stays in the controller's state
	/// map; only an explicit closing release changes membership.
	fn drop_peer(&self, site: &SiteId) {
		let mut peers = self.peers.lock().unwrap();
		peers.waiting.remove(site);
		if peers.admitted.remove(site).is_some() {
			warn!(site = %self.site, peer = %site, "peer link lost");
		}
	}

	fn run_actions(&self, actions: Vec<WaveAction>) {
		for action in actions {
			match action {
				WaveAction::Forward { to, line } => self.send_to(&to, line),
				WaveAction::Deliver(payload) => self.emit(NetEvent::Deliver(payload)),
				WaveAction::Done(wave) => {
					debug!(site = %self.site, wave = %wave, "wave terminated");
					self.emit(NetEvent::WaveDone(wave));
				}
			}
		}
	}

	fn handle_line(&self, from: &SiteId, line: &str) {
		if !Envelope::is_envelope(line) {
			warn!(site = %self.site, peer = %from, "unexpected non-wave line dropped");
			return;
		}
		let env = match Envelope::parse(line) {
			Ok(env) => env,
			Err(error) => {
				warn!(site = %self.site, peer = %from, %error, "malformed wave line dropped");
				return;
			}
		};

		let peers = self.peers.lock().unwrap().admitted_ids();
		let actions = {
			let mut waves = self.waves.lock().unwrap();
			match env.colour {
				Colour::Blue => waves.on_blue(
					env.wave,
					env.forwarder,
					env.payload.unwrap_or_default(),
					&peers,
				),
				Colour::Red => waves.on_red(env.wave),
			}
		};
		self.run_actions(actions);
	}
}

async fn accept_loop(inner: Arc<NetworkInner>, listener: TcpListener) {
	loop {
		tokio::select! {
			accepted = listener.accept() => match accepted {
				Ok((stream, addr)) => {
					tokio::spawn(handle_incoming(inner.clone(), stream, addr));
				}
				Err(error) => warn!(site = %inner.site, %error, "accept failed"),
			},
			() = inner.shutdown.cancelled() => break,
		}
	}
}

async fn handle_incoming(inner: Arc<NetworkInner>, stream: TcpStream, addr: SocketAddr) {
	let (read_half, write_half) = stream.into_split();
	let handle = spawn_writer(write_half, inner.shutdown.child_token());
	inner
		.peers
		.lock()
		.unwrap()
		.pending
		.insert(addr, handle.clone());

	let mut lines = BufReader::new(read_half).lines();

	// The handshake is always a single access-request line.
	let first = tokio::select! {
		line = lines.next_line() => line,
		() = inner.shutdown.cancelled() => Ok(None),
	};
	let candidate = match first {
		Ok(Some(line)) => match Message::parse(&line) {
			Ok(Message::AccessRequest { site }) => site,
			Ok(other) => {
				warn!(site = %inner.site, %addr, kind = other.kind(), "handshake line has wrong kind");
				inner.peers.lock().unwrap().pending.remove(&addr);
				return;
			}
			Err(error) => {
				warn!(site = %inner.site, %addr, %error, "malformed handshake line");
				inner.peers.lock().unwrap().pending.remove(&addr);
				return;
			}
		},
		_ => {
			inner.peers.lock().unwrap().pending.remove(&addr);
			return;
		}
	};

	let known_already = {
		let mut peers = inner.peers.lock().unwrap();
		peers.pending.remove(&addr);
		if peers.formerly.contains(&candidate) {
			// Reconnection after a topology reshuffle: no snapshot, no
			// admission round.
			let line = Message::AccessGranted {
				site: inner.site.clone(),
				known: Vec::new(),
				snapshot: None,
			}
			.encode();
			handle.send(line);
			peers.admit(candidate.clone(), handle.clone());
			true
		} else {
			let solo = peers.admitted.is_empty();
			peers.waiting.insert(candidate.clone(), handle.clone());
			drop(peers);
			inner.emit(NetEvent::Access {
				candidate: candidate.clone(),
				solo,
			});
			false
		}
	};
	if known_already {
		info!(site = %inner.site, peer = %candidate, "known peer reconnected");
	}

	read_peer_lines(&inner, candidate, lines).await;
}

async fn dial(inner: Arc<NetworkInner>, target: String) {
	for attempt in 1..=CONNECT_RETRY_LIMIT {
		if inner.shutdown.is_cancelled() {
			return;
		}
		match TcpStream::connect(&target).await {
			Ok(stream) => {
				debug!(site = %inner.site, %target, attempt, "connected to bootstrap target");
				handle_outgoing(inner.clone(), stream).await;
				return;
			}
			Err(error) => {
				debug!(site = %inner.site, %target, attempt, %error, "bootstrap connect failed");
				tokio::time::sleep(CONNECT_RETRY_DELAY).await;
			}
		}
	}
	warn!(site = %inner.site, %target, "bootstrap target unreachable, giving up");
}

async fn handle_outgoing(inner: Arc<NetworkInner>, stream: TcpStream) {
	let (read_half, write_half) = stream.into_split();
	let handle = spawn_writer(write_half, inner.shutdown.child_token());
	handle.send(
		Message::AccessRequest {
			site: inner.site.clone(),
		}
		.encode(),
	);

	let mut lines = BufReader::new(read_half).lines();

	// Wait for the grant; it may take a full release cycle when our
	// admission is queued behind somebody's critical section.
	loop {
		let line = tokio::select! {
			line = lines.next_line() => line,
			() = inner.shutdown.cancelled() => Ok(None),
		};
		match line {
			Ok(Some(line)) => match Message::parse(&line) {
				Ok(Message::AccessGranted {
					site: via,
					known,
					snapshot,
				}) => {
					inner
						.peers
						.lock()
						.unwrap()
						.admit(via.clone(), handle.clone());
					info!(site = %inner.site, via = %via, "admitted into the group");
					inner.emit(NetEvent::Joined {
						via: via.clone(),
						known,
						snapshot,
					});
					read_peer_lines(&inner, via, lines).await;
					return;
				}
				Ok(other) => {
					warn!(site = %inner.site, kind = other.kind(), "line before grant dropped");
				}
				Err(error) => {
					warn!(site = %inner.site, %error, "malformed line before grant dropped");
				}
			},
			_ => {
				warn!(site = %inner.site, "bootstrap link closed before grant");
				return;
			}
		}
	}
}

async fn read_peer_lines(
	inner: &Arc<NetworkInner>,
	peer: SiteId,
	mut lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
) {
	loop {
		let line = tokio::select! {
			line = lines.next_line() => line,
			() = inner.shutdown.cancelled() => Ok(None),
		};
		match line {
			Ok(Some(line)) => inner.handle_line(&peer, &line),
			Ok(None) => break,
			Err(error) => {
				warn!(site = %inner.site, peer = %peer, %error, "peer read failed");
				break;
			}
		}
	}
	inner.drop_peer(&peer);
}

//! Peer connection bookkeeping and per-link writer tasks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use quill_proto::SiteId;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Sending side of one peer link.
///
/// Lines are queued on an unbounded channel feeding the link's writer
/// task, so a send never blocks and never awaits under a lock.
#[derive(Debug, Clone)]
pub(crate) struct PeerHandle {
	tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
	/// Queues one line; false when the writer task is gone.
	pub(crate) fn send(&self, line: String) -> bool {
		self.tx.send(line).is_ok()
	}
}

/// Spawns the writer task for one link and returns its handle.
///
/// The task appends the line framing and exits on write failure, on
/// shutdown, or once every handle is dropped.
pub(crate) fn spawn_writer<W>(writer: W, shutdown: CancellationToken) -> PeerHandle
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	let (tx, mut rx) = mpsc::unbounded_channel::<String>();
	tokio::spawn(async move {
		let mut writer = BufWriter::new(writer);
		loop {
			tokio::select! {
				maybe = rx.recv() => {
					let Some(line) = maybe else { break };
					let result = async {
						writer.write_all(line.as_bytes()).await?;
						writer.write_all(b"\n").await?;
						writer.flush().await
					}
					.await;
					if let Err(error) = result {
						warn!(%error, "peer write failed, closing link");
						break;
					}
				}
				() = shutdown.cancelled() => break,
			}
		}
	});
	PeerHandle { tx }
}

/// The three peer maps plus the set of sites ever admitted here.
///
/// Everything lives behind one mutex in the network layer; none of the
/// methods block.
#[derive(Debug, Default)]
pub(crate) struct PeerMaps {
	/// Fully admitted peers by site id.
	pub(crate) admitted: HashMap<SiteId, PeerHandle>,
	/// Inbound connections that have not identified themselves yet.
	pub(crate) pending: HashMap<SocketAddr, PeerHandle>,
	/// Candidates whose admission is queued with the controller.
	pub(crate) waiting: HashMap<SiteId, PeerHandle>,
	/// Sites admitted at some point; a redial from one of these is a
	/// reconnection, not a new member.
	pub(crate) formerly: HashSet<SiteId>,
}

impl PeerMaps {
	pub(crate) fn admit(&mut self, site: SiteId, handle: PeerHandle) {
		self.formerly.insert(site.clone());
		self.admitted.insert(site, handle);
	}

	pub(crate) fn admitted_ids(&self) -> Vec<SiteId> {
		self.admitted.keys().cloned().collect()
	}
}

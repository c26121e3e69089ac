//! The site runtime: one process hosting a controller and the overlay
//! network layer, speaking the line protocol with an external editor
//! over a byte stream pair (stdin/stdout in production).
//!
//! # Task layout
//!
//! - an editor reader task feeding parsed lines into the event loop,
//! - an editor writer task draining outbound editor lines,
//! - the network layer's own accept/dial/reader/writer tasks,
//! - one event loop owning the [`Controller`], consuming editor lines
//!   and network events one at a time. No controller state is touched
//!   anywhere else.
//!
//! # Shutdown
//!
//! An editor exit turns into a parting release; once the wave carrying
//! it terminates, the runtime writes the shutdown line to the editor,
//! cancels every task, and [`SiteRuntime::wait`] returns.

#![warn(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;

use quill_control::{Controller, CutStore, Inbound, Outbound};
use quill_net::{NetConfig, NetEvent, Network};
use quill_proto::{Message, SiteId, WaveId, paths};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Launch configuration for one site.
#[derive(Debug, Clone)]
pub struct SiteConfig {
	/// Globally unique site id.
	pub site_id: SiteId,
	/// Directory holding the diff log and the cut store.
	pub output_dir: PathBuf,
	/// TCP port to listen on; 0 lets the OS pick.
	pub listen_port: u16,
	/// `host:port` members to join through at startup.
	pub bootstrap: Vec<String>,
	/// Document name; the editor keeps its log at
	/// `<output_dir>/<filename>.log`.
	pub filename: String,
	/// Verbose logging plus manual commit triggers in the editor.
	pub debug: bool,
}

/// A started site.
#[derive(Debug)]
pub struct SiteRuntime {
	local_addr: SocketAddr,
	site_id: SiteId,
	handle: JoinHandle<()>,
}

impl SiteRuntime {
	/// Creates the output directory, starts the network layer and every
	/// runtime task. Fatal startup problems (unwritable output
	/// directory, unbindable port) surface here.
	pub async fn start<R, W>(
		config: SiteConfig,
		editor_in: R,
		editor_out: W,
		shutdown: CancellationToken,
	) -> std::io::Result<Self>
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		std::fs::create_dir_all(&config.output_dir)?;
		info!(
			site = %config.site_id,
			log = %paths::log_path(&config.output_dir, &config.filename).display(),
			"site starting"
		);

		let controller = Controller::new(
			config.site_id.clone(),
			CutStore::new(paths::cut_path(&config.output_dir)),
		);

		let (net_tx, net_rx) = mpsc::unbounded_channel();
		let network = Network::start(
			NetConfig {
				site: config.site_id.clone(),
				listen_port: config.listen_port,
				bootstrap: config.bootstrap.clone(),
			},
			net_tx,
			shutdown.clone(),
		)
		.await?;
		let local_addr = network.local_addr();

		let (editor_tx, editor_rx) = mpsc::unbounded_channel::<String>();
		tokio::spawn(editor_writer(editor_out, editor_rx));

		let (line_tx, line_rx) = mpsc::unbounded_channel::<Message>();
		tokio::spawn(editor_reader(editor_in, line_tx, shutdown.clone()));

		let site_loop = SiteLoop {
			controller,
			network,
			editor_tx,
			closing_wave: None,
			shutdown: shutdown.clone(),
		};
		let handle = tokio::spawn(site_loop.run(line_rx, net_rx));

		Ok(Self {
			local_addr,
			site_id: config.site_id,
			handle,
		})
	}

	/// Address the network layer is listening on.
	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// This site's id.
	#[must_use]
	pub fn site_id(&self) -> &SiteId {
		&self.site_id
	}

	/// Runs until the site shuts down (editor exit or cancellation).
	pub async fn wait(self) {
		let _ = self.handle.await;
	}
}

struct SiteLoop {
	controller: Controller,
	network: Network,
	editor_tx: mpsc::UnboundedSender<String>,
	closing_wave: Option<WaveId>,
	shutdown: CancellationToken,
}

impl SiteLoop {
	async fn run(
		mut self,
		mut editor_rx: mpsc::UnboundedReceiver<Message>,
		mut net_rx: mpsc::UnboundedReceiver<NetEvent>,
	) {
		loop {
			tokio::select! {
				maybe = editor_rx.recv() => {
					let Some(msg) = maybe else { break };
					let outs = self.controller.handle(Inbound::Editor(msg));
					self.dispatch(outs);
				}
				maybe = net_rx.recv() => {
					let Some(event) = maybe else { break };
					if self.on_net_event(event) {
						break;
					}
				}
				() = self.shutdown.cancelled() => break,
			}
		}
		self.shutdown.cancel();
	}

	/// Returns true once the site is done.
	fn on_net_event(&mut self, event: NetEvent) -> bool {
		match event {
			NetEvent::Deliver(payload) => match Message::parse(&payload) {
				Ok(msg) => {
					let outs = self.controller.handle(Inbound::Peer(msg));
					self.dispatch(outs);
				}
				Err(error) => {
					warn!(site = %self.controller.site(), %error, "undecodable wave payload dropped");
				}
			},
			NetEvent::Access { candidate, solo } => {
				let outs = self.controller.handle(Inbound::Access { candidate, solo });
				self.dispatch(outs);
			}
			NetEvent::Joined {
				via,
				known,
				snapshot,
			} => {
				let mut members = known;
				members.push(via);
				let outs = self.controller.handle(Inbound::Members(members));
				self.dispatch(outs);
				if let Some(text) = snapshot {
					// The editor owns the log; it rewrites it from the
					// snapshot and redisplays.
					self.send_editor(Message::ReturnText { text });
				}
			}
			NetEvent::WaveDone(wave) => {
				if self.closing_wave.as_ref() == Some(&wave) {
					info!(site = %self.controller.site(), "parting release delivered, shutting down");
					self.send_editor(Message::Shutdown);
					return true;
				}
				debug!(site = %self.controller.site(), wave = %wave, "wave finished");
			}
		}
		false
	}

	fn dispatch(&mut self, outs: Vec<Outbound>) {
		for out in outs {
			match out {
				Outbound::Editor(msg) => self.send_editor(msg),
				Outbound::Broadcast { message, closing } => {
					let wave = self.network.broadcast(&message.encode());
					if closing {
						self.closing_wave = Some(wave);
					}
				}
				Outbound::Grant {
					candidate,
					known,
					snapshot,
				} => self.network.grant(&candidate, known, snapshot),
			}
		}
	}

	fn send_editor(&self, msg: Message) {
		if self.editor_tx.send(msg.encode()).is_err() {
			debug!(site = %self.controller.site(), "editor writer gone");
		}
	}
}

async fn editor_reader<R>(
	editor_in: R,
	lines_out: mpsc::UnboundedSender<Message>,
	shutdown: CancellationToken,
) where
	R: AsyncRead + Unpin + Send + 'static,
{
	let mut lines = BufReader::new(editor_in).lines();
	loop {
		let line = tokio::select! {
			line = lines.next_line() => line,
			() = shutdown.cancelled() => Ok(None),
		};
		match line {
			Ok(Some(line)) if line.is_empty() => {}
			Ok(Some(line)) => match Message::parse(&line) {
				Ok(msg) => {
					if lines_out.send(msg).is_err() {
						break;
					}
				}
				Err(error) => warn!(%error, "malformed editor line dropped"),
			},
			_ => break,
		}
	}
}

/// Drains editor-bound lines until every sender is gone, so the final
/// shutdown line always reaches the editor before the task exits.
async fn editor_writer<W>(editor_out: W, mut lines_in: mpsc::UnboundedReceiver<String>)
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	let mut writer = BufWriter::new(editor_out);
	while let Some(line) = lines_in.recv().await {
		let result = async {
			writer.write_all(line.as_bytes()).await?;
			writer.write_all(b"\n").await?;
			writer.flush().await
		}
		.await;
		if let Err(error) = result {
			warn!(%error, "editor write failed");
			break;
		}
	}
}

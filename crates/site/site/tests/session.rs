//! End-to-end site sessions over loopback TCP, with scripted editors
//! standing in for the GUI front-end.

use std::path::Path;
use std::time::Duration;

use quill_control::CutStore;
use quill_proto::{Diff, Message, SiteId, paths};
use quill_replica::{DiffLog, apply_diffs_reverse};
use quill_site::{SiteConfig, SiteRuntime};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

/// A scripted editor: drives the site over its stdio protocol and keeps
/// its own diff log, like the real front-end would.
struct Editor {
	reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
	writer: WriteHalf<DuplexStream>,
	log: DiffLog,
	text: String,
}

impl Editor {
	fn new(stream: DuplexStream, log: DiffLog) -> Self {
		let (r, w) = tokio::io::split(stream);
		let text = log.replay_from(0, "").unwrap();
		Self {
			reader: BufReader::new(r).lines(),
			writer: w,
			log,
			text,
		}
	}

	async fn send(&mut self, msg: Message) {
		self.writer
			.write_all(msg.encode().as_bytes())
			.await
			.unwrap();
		self.writer.write_all(b"\n").await.unwrap();
		self.writer.flush().await.unwrap();
	}

	async fn recv(&mut self) -> Message {
		let line = tokio::time::timeout(Duration::from_secs(10), self.reader.next_line())
			.await
			.expect("timed out waiting for a controller line")
			.expect("editor stream failed")
			.expect("controller closed the stream");
		Message::parse(&line).expect("controller sent a malformed line")
	}

	fn apply_remote(&mut self, diffs: &[Diff]) {
		let updated = apply_diffs_reverse(&self.text, diffs);
		self.log.append(&self.text, &updated).unwrap();
		self.text = updated;
	}

	/// Commits `new_text`: request the section, wait for the grant
	/// (applying remote updates that slip in first), save, release.
	async fn commit(&mut self, new_text: &str) {
		self.send(Message::AppRequest).await;
		loop {
			match self.recv().await {
				Message::StartCs => break,
				Message::ApplyUpdate { diffs } => self.apply_remote(&diffs),
				other => panic!("unexpected message while requesting: {other:?}"),
			}
		}
		let diffs = self.log.append(&self.text, new_text).unwrap();
		self.text = new_text.to_owned();
		self.send(Message::AppRelease { diffs }).await;
	}

	/// Answers a pending snapshot request with the committed text.
	async fn serve_snapshot(&mut self) {
		match self.recv().await {
			Message::SharedText {
				candidate,
				text: None,
			} => {
				let text = self.text.clone();
				self.send(Message::SharedText {
					candidate,
					text: Some(text),
				})
				.await;
			}
			other => panic!("expected a snapshot request, got {other:?}"),
		}
	}

	/// Installs an incoming snapshot into the local log.
	async fn take_snapshot(&mut self) -> String {
		match self.recv().await {
			Message::ReturnText { text } => {
				self.log.install_snapshot(&text).unwrap();
				self.text = text.clone();
				text
			}
			other => panic!("expected a snapshot, got {other:?}"),
		}
	}
}

async fn spawn_site(
	id: &str,
	dir: &Path,
	bootstrap: Vec<String>,
	parent: &CancellationToken,
) -> (SiteRuntime, Editor) {
	let (editor_side, site_side) = tokio::io::duplex(64 * 1024);
	let (site_r, site_w) = tokio::io::split(site_side);
	let runtime = SiteRuntime::start(
		SiteConfig {
			site_id: SiteId::from(id),
			output_dir: dir.to_path_buf(),
			listen_port: 0,
			bootstrap,
			filename: "doc".to_owned(),
			debug: false,
		},
		site_r,
		site_w,
		parent.child_token(),
	)
	.await
	.expect("site failed to start");
	let log = DiffLog::new(paths::log_path(dir, "doc"));
	(runtime, Editor::new(editor_side, log))
}

fn target(site: &SiteRuntime) -> String {
	format!("127.0.0.1:{}", site.local_addr().port())
}

#[tokio::test]
async fn snapshot_join_installs_the_document() {
	let shutdown = CancellationToken::new();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	// a starts alone with pre-existing text.
	DiffLog::new(paths::log_path(dir_a.path(), "doc"))
		.append("", "abcdef")
		.unwrap();
	let (site_a, mut ed_a) = spawn_site("site-a", dir_a.path(), vec![], &shutdown).await;
	assert_eq!(ed_a.text, "abcdef");

	let (_site_b, mut ed_b) =
		spawn_site("site-b", dir_b.path(), vec![target(&site_a)], &shutdown).await;

	// a is idle, so the handshake only needs the snapshot round trip.
	ed_a.serve_snapshot().await;
	let text = ed_b.take_snapshot().await;
	assert_eq!(text, "abcdef");

	// The newcomer's log is rewritten to a single insert-from-empty.
	assert_eq!(ed_b.log.len_since(0), 1);
	assert_eq!(ed_b.log.replay_from(0, "").unwrap(), "abcdef");

	shutdown.cancel();
}

#[tokio::test]
async fn alternating_edits_converge_and_shut_down() {
	let shutdown = CancellationToken::new();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	let (site_a, mut ed_a) = spawn_site("site-a", dir_a.path(), vec![], &shutdown).await;
	let (_site_b, mut ed_b) =
		spawn_site("site-b", dir_b.path(), vec![target(&site_a)], &shutdown).await;

	// Empty-text join: the newcomer's log is truncated to nothing.
	ed_a.serve_snapshot().await;
	let text = ed_b.take_snapshot().await;
	assert!(text.is_empty());
	assert_eq!(ed_b.log.len_since(0), 0);

	// a edits, b observes.
	ed_a.commit("HELLO").await;
	match ed_b.recv().await {
		Message::ApplyUpdate { diffs } => ed_b.apply_remote(&diffs),
		other => panic!("expected an update, got {other:?}"),
	}
	assert_eq!(ed_b.text, "HELLO");

	// b edits, a observes.
	ed_b.commit("HELLO WORLD").await;
	match ed_a.recv().await {
		Message::ApplyUpdate { diffs } => ed_a.apply_remote(&diffs),
		other => panic!("expected an update, got {other:?}"),
	}
	assert_eq!(ed_a.text, "HELLO WORLD");

	// Both logs replay to the same committed text.
	assert_eq!(ed_a.log.replay_from(0, "").unwrap(), "HELLO WORLD");
	assert_eq!(ed_b.log.replay_from(0, "").unwrap(), "HELLO WORLD");

	// a's editor exits; the parting release travels the group, then the
	// site orders the editor to shut down and its runtime finishes.
	ed_a.send(Message::AppDied).await;
	loop {
		match ed_a.recv().await {
			Message::Shutdown => break,
			Message::ApplyUpdate { .. } => {}
			other => panic!("unexpected message during shutdown: {other:?}"),
		}
	}
	tokio::time::timeout(Duration::from_secs(10), site_a.wait())
		.await
		.expect("site did not shut down");

	shutdown.cancel();
}

#[tokio::test]
async fn late_joiner_is_admitted_at_a_release_boundary() {
	let shutdown = CancellationToken::new();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();
	let dir_c = tempfile::tempdir().unwrap();

	let (site_a, mut ed_a) = spawn_site("site-a", dir_a.path(), vec![], &shutdown).await;
	let (site_b, mut ed_b) =
		spawn_site("site-b", dir_b.path(), vec![target(&site_a)], &shutdown).await;
	ed_a.serve_snapshot().await;
	ed_b.take_snapshot().await;

	// c dials b, which already has a peer: the admission rides on b's
	// next release, which b's controller provokes on its own.
	let (_site_c, mut ed_c) =
		spawn_site("site-c", dir_c.path(), vec![target(&site_b)], &shutdown).await;

	// b's editor is granted the section it never asked for and releases
	// with nothing to commit.
	loop {
		match ed_b.recv().await {
			Message::StartCs => {
				let diffs = Vec::new();
				ed_b.send(Message::AppRelease { diffs }).await;
			}
			Message::SharedText {
				candidate,
				text: None,
			} => {
				let text = ed_b.text.clone();
				ed_b.send(Message::SharedText {
					candidate,
					text: Some(text),
				})
				.await;
				break;
			}
			other => panic!("unexpected message during admission: {other:?}"),
		}
	}

	// a observed b's (empty) release carrying the admission.
	match ed_a.recv().await {
		Message::ApplyUpdate { diffs } => assert!(diffs.is_empty()),
		other => panic!("expected b's empty release, got {other:?}"),
	}

	// c received the snapshot and is wired into the overlay.
	ed_c.take_snapshot().await;
	ed_c.commit("C WAS HERE").await;

	for ed in [&mut ed_a, &mut ed_b] {
		match ed.recv().await {
			Message::ApplyUpdate { diffs } => ed.apply_remote(&diffs),
			other => panic!("expected c's edit, got {other:?}"),
		}
		assert_eq!(ed.text, "C WAS HERE");
	}

	shutdown.cancel();
}

#[tokio::test]
async fn cut_markers_record_clocks_on_every_site() {
	let shutdown = CancellationToken::new();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	let (site_a, mut ed_a) = spawn_site("site-a", dir_a.path(), vec![], &shutdown).await;
	let (_site_b, mut ed_b) =
		spawn_site("site-b", dir_b.path(), vec![target(&site_a)], &shutdown).await;
	ed_a.serve_snapshot().await;
	ed_b.take_snapshot().await;

	// Put some causal history on both sides first.
	ed_a.commit("x").await;
	match ed_b.recv().await {
		Message::ApplyUpdate { diffs } => ed_b.apply_remote(&diffs),
		other => panic!("expected an update, got {other:?}"),
	}

	ed_a.send(Message::Cut {
		cut_id: None,
		hops: 0,
		site: None,
		clock: None,
	})
	.await;

	// The marker wave is asynchronous; poll both stores.
	let store_a = CutStore::new(paths::cut_path(dir_a.path()));
	let store_b = CutStore::new(paths::cut_path(dir_b.path()));
	let mut recorded = None;
	for _ in 0..200 {
		let cuts_a = store_a.load().unwrap_or_default();
		let cuts_b = store_b.load().unwrap_or_default();
		if let (Some(ca), Some(cb)) = (cuts_a.get("cut_number_1"), cuts_b.get("cut_number_1")) {
			recorded = Some((ca.clone(), cb.clone()));
			break;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	let (ca, cb) = recorded.expect("cut was not recorded on both sites");

	// The recorded clocks must not cross: one dominates the other.
	let va = ca.values().next().unwrap();
	let vb = cb.values().next().unwrap();
	let a_le_b = va.0.iter().all(|(site, n)| vb.get(site) >= *n);
	let b_le_a = vb.0.iter().all(|(site, n)| va.get(site) >= *n);
	assert!(a_le_b || b_le_a, "recorded clocks form an inconsistent cut");

	shutdown.cancel();
}

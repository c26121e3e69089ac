//! Overlay behaviour over loopback TCP: join handshakes and wave
//! broadcast across small topologies.

use std::time::Duration;

use quill_net::{NetConfig, NetEvent, Network};
use quill_proto::{Message, SiteId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn start(
	site: &str,
	bootstrap: Vec<String>,
	shutdown: &CancellationToken,
) -> (Network, mpsc::UnboundedReceiver<NetEvent>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let net = Network::start(
		NetConfig {
			site: SiteId::from(site),
			listen_port: 0,
			bootstrap,
		},
		tx,
		shutdown.clone(),
	)
	.await
	.expect("bind failed");
	(net, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<NetEvent>) -> NetEvent {
	tokio::time::timeout(Duration::from_secs(10), rx.recv())
		.await
		.expect("timed out waiting for a network event")
		.expect("event channel closed")
}

fn loopback(net: &Network) -> String {
	format!("127.0.0.1:{}", net.local_addr().port())
}

#[tokio::test]
async fn solo_broadcast_terminates_immediately() {
	let shutdown = CancellationToken::new();
	let (a, mut ra) = start("a", vec![], &shutdown).await;

	let wave = a.broadcast(&Message::AppRequest.encode());
	assert_eq!(next_event(&mut ra).await, NetEvent::WaveDone(wave));
	shutdown.cancel();
}

#[tokio::test]
async fn join_handshake_carries_snapshot_and_members() {
	let shutdown = CancellationToken::new();
	let (a, mut ra) = start("a", vec![], &shutdown).await;
	let (_b, mut rb) = start("b", vec![loopback(&a)], &shutdown).await;

	// a is alone, so the candidate can be granted without a release.
	match next_event(&mut ra).await {
		NetEvent::Access { candidate, solo } => {
			assert_eq!(candidate, SiteId::from("b"));
			assert!(solo);
		}
		other => panic!("expected access request, got {other:?}"),
	}

	a.grant(
		&SiteId::from("b"),
		vec![SiteId::from("a"), SiteId::from("b")],
		"abcdef".to_owned(),
	);

	match next_event(&mut rb).await {
		NetEvent::Joined {
			via,
			known,
			snapshot,
		} => {
			assert_eq!(via, SiteId::from("a"));
			assert!(known.contains(&SiteId::from("a")));
			assert_eq!(snapshot.as_deref(), Some("abcdef"));
		}
		other => panic!("expected join, got {other:?}"),
	}
	assert_eq!(a.admitted(), vec![SiteId::from("b")]);

	// A wave from a now reaches b exactly once and folds back.
	let payload = Message::AppRequest.encode();
	let wave = a.broadcast(&payload);
	assert_eq!(next_event(&mut rb).await, NetEvent::Deliver(payload));
	assert_eq!(next_event(&mut ra).await, NetEvent::WaveDone(wave));
	shutdown.cancel();
}

#[tokio::test]
async fn line_topology_delivers_exactly_once_everywhere() {
	let shutdown = CancellationToken::new();
	let (a, mut ra) = start("a", vec![], &shutdown).await;
	let (b, mut rb) = start("b", vec![loopback(&a)], &shutdown).await;

	assert!(matches!(next_event(&mut ra).await, NetEvent::Access { solo: true, .. }));
	a.grant(&SiteId::from("b"), vec![SiteId::from("a")], String::new());
	assert!(matches!(next_event(&mut rb).await, NetEvent::Joined { .. }));

	// c joins through b, which already has a peer: not a solo case.
	let (_c, mut rc) = start("c", vec![loopback(&b)], &shutdown).await;
	match next_event(&mut rb).await {
		NetEvent::Access { candidate, solo } => {
			assert_eq!(candidate, SiteId::from("c"));
			assert!(!solo);
		}
		other => panic!("expected access request, got {other:?}"),
	}
	b.grant(
		&SiteId::from("c"),
		vec![SiteId::from("a"), SiteId::from("b")],
		String::new(),
	);
	assert!(matches!(next_event(&mut rc).await, NetEvent::Joined { .. }));

	// a -> b -> c: the payload crosses the relay exactly once per site.
	let payload = Message::AppRequest.encode();
	let wave = a.broadcast(&payload);
	assert_eq!(next_event(&mut rb).await, NetEvent::Deliver(payload.clone()));
	assert_eq!(next_event(&mut rc).await, NetEvent::Deliver(payload));
	assert_eq!(next_event(&mut ra).await, NetEvent::WaveDone(wave));

	assert!(rb.try_recv().is_err(), "relay saw a duplicate");
	assert!(rc.try_recv().is_err(), "leaf saw a duplicate");
	shutdown.cancel();
}

#[tokio::test]
async fn cyclic_topology_deduplicates_blue_lines() {
	let shutdown = CancellationToken::new();
	let (a, mut ra) = start("a", vec![], &shutdown).await;
	let (b, mut rb) = start("b", vec![loopback(&a)], &shutdown).await;

	assert!(matches!(next_event(&mut ra).await, NetEvent::Access { solo: true, .. }));
	a.grant(&SiteId::from("b"), vec![SiteId::from("a")], String::new());
	assert!(matches!(next_event(&mut rb).await, NetEvent::Joined { .. }));

	// c connects to both a and b, closing the triangle.
	let (_c, mut rc) = start("c", vec![loopback(&a), loopback(&b)], &shutdown).await;
	for (net, rx) in [(&a, &mut ra), (&b, &mut rb)] {
		match next_event(rx).await {
			NetEvent::Access { candidate, solo } => {
				assert_eq!(candidate, SiteId::from("c"));
				assert!(!solo);
			}
			other => panic!("expected access request, got {other:?}"),
		}
		net.grant(&SiteId::from("c"), vec![], String::new());
	}
	assert!(matches!(next_event(&mut rc).await, NetEvent::Joined { .. }));
	assert!(matches!(next_event(&mut rc).await, NetEvent::Joined { .. }));

	let payload = Message::AppRequest.encode();
	let wave = a.broadcast(&payload);

	assert_eq!(next_event(&mut rb).await, NetEvent::Deliver(payload.clone()));
	assert_eq!(next_event(&mut rc).await, NetEvent::Deliver(payload));
	assert_eq!(next_event(&mut ra).await, NetEvent::WaveDone(wave));

	// The cycle produced duplicate blues, but they were answered with
	// reds, never delivered twice.
	assert!(rb.try_recv().is_err());
	assert!(rc.try_recv().is_err());
	shutdown.cancel();
}

#[tokio::test]
async fn reconnecting_peer_is_granted_without_a_snapshot() {
	let shutdown = CancellationToken::new();
	let (a, mut ra) = start("a", vec![], &shutdown).await;
	let (_b, mut rb) = start("b", vec![loopback(&a)], &shutdown).await;

	assert!(matches!(next_event(&mut ra).await, NetEvent::Access { solo: true, .. }));
	a.grant(&SiteId::from("b"), vec![SiteId::from("a")], "text".to_owned());
	assert!(matches!(next_event(&mut rb).await, NetEvent::Joined { .. }));

	// The same site dials again, e.g. after a topology reshuffle.
	let (_b2, mut rb2) = start("b", vec![loopback(&a)], &shutdown).await;
	match next_event(&mut rb2).await {
		NetEvent::Joined { via, snapshot, .. } => {
			assert_eq!(via, SiteId::from("a"));
			assert_eq!(snapshot, None, "reconnection must not refresh the snapshot");
		}
		other => panic!("expected rejoin, got {other:?}"),
	}
	shutdown.cancel();
}

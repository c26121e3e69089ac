//! The per-site controller: a replicated state machine granting write
//! access to the shared document.
//!
//! # Mental model
//!
//! - Every site runs one [`Controller`]. It owns the Lamport stamp, the
//!   vector clock, the per-peer state map, and the admission queue; no
//!   other task touches them.
//! - The controller is a pure event loop: [`Controller::handle`] consumes
//!   one inbound message and returns the messages to send. It never
//!   blocks and never performs network I/O; the site runtime routes the
//!   returned [`Outbound`]s to the editor or the wave broadcast.
//! - Write access is a logical token. A site asks for it by broadcasting
//!   a stamped request; it holds it once every other known peer is
//!   observed with a later `(stamp, id)` pair; it gives it up by
//!   broadcasting a release that carries the committed diffs.
//! - Peers that have never stamped a message sit in the state map with
//!   an absent stamp. Absent stamps lose every comparison, so a
//!   freshly admitted member can neither block nor steal the token.
//! - Membership only grows through admissions bundled on a release
//!   (atomic across the group) and only shrinks through a release
//!   carrying the closing flag. A silent peer stays in the map.
//!
//! # Invariants
//!
//! 1. Only [`Controller::handle`] mutates controller state; one inbound
//!    message is fully processed before the next (single-writer).
//! 2. The grant check compares `(stamp, site id)` lexicographically and
//!    treats absent stamps as losing, so grants follow the total request
//!    order and newcomers without a request never win.
//! 3. A release updates the state map, admits queued candidates, and
//!    forwards the diffs to the editor in one step; observers see the
//!    group change and the edit together.
//! 4. A cut marker is recorded at most once per cut id, and re-emission
//!    stops once the hop count reaches the known membership size.
//!
//! # Message flow
//!
//! Editor lines arrive as [`Inbound::Editor`], wave-delivered peer
//! payloads as [`Inbound::Peer`]; the network layer reports admission
//! candidates with [`Inbound::Access`] and the member list learned at
//! join time with [`Inbound::Members`]. Outbound messages either go back
//! to the editor verbatim, get wave-broadcast to the group, or complete
//! a pending admission handshake ([`Outbound::Grant`]).

#![warn(missing_docs)]

mod controller;
mod cut;
mod state;

pub use controller::{Controller, Inbound, Outbound};
pub use cut::CutStore;
pub use state::{PeerEntry, PeerKind, Phase, StateMap};

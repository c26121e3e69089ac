//! Line codec for the quill wire format.
//!
//! Every message is one line of `<F><K>key<K>value` fields, where `<F>`
//! and `<K>` are fixed control characters. Values never contain the
//! separators: JSON-valued fields are safe because JSON escapes control
//! characters, and free text substitutes [`NEWLINE_MARK`] for newlines
//! before transmission.

use serde_json::Error as JsonError;
use thiserror::Error;

use crate::types::{Colour, Diff, Envelope, Message, SiteId, VectorClock, WaveId};

/// Field separator, ASCII record separator.
pub const FIELD_SEP: char = '\u{1e}';
/// Key/value separator, ASCII unit separator.
pub const KEY_SEP: char = '\u{1f}';
/// Stand-in for `\n` inside text-valued fields.
pub const NEWLINE_MARK: char = '↩';

/// Errors raised while parsing a wire line.
#[derive(Debug, Error)]
pub enum ProtoError {
	/// The line carries no `typ` field.
	#[error("message has no `typ` field")]
	MissingType,
	/// The `typ` field names no known message kind.
	#[error("unknown message kind `{0}`")]
	UnknownKind(String),
	/// A required field is absent.
	#[error("missing field `{0}`")]
	MissingField(&'static str),
	/// A numeric field failed to parse.
	#[error("field `{field}` is not a number: `{value}`")]
	BadNumber {
		/// Offending field key.
		field: &'static str,
		/// Raw field value.
		value: String,
	},
	/// A JSON-valued field failed to deserialize.
	#[error("field `{field}` is not valid JSON: {source}")]
	BadJson {
		/// Offending field key.
		field: &'static str,
		/// Underlying JSON error.
		source: JsonError,
	},
	/// A wave envelope is structurally broken.
	#[error("malformed wave envelope: {0}")]
	BadEnvelope(&'static str),
}

/// Substitutes [`NEWLINE_MARK`] for newlines so a text can travel in one
/// line-framed field.
#[must_use]
pub fn escape_text(text: &str) -> String {
	text.replace('\n', &NEWLINE_MARK.to_string())
}

/// Reverses [`escape_text`].
#[must_use]
pub fn unescape_text(text: &str) -> String {
	text.replace(NEWLINE_MARK, "\n")
}

fn field(key: &str, val: &str) -> String {
	debug_assert!(
		!val.contains(FIELD_SEP) && !val.contains(KEY_SEP),
		"separator byte inside field value"
	);
	format!("{FIELD_SEP}{KEY_SEP}{key}{KEY_SEP}{val}")
}

/// Looks up the value of `key` in an encoded line.
#[must_use]
pub fn find_val<'a>(line: &'a str, key: &str) -> Option<&'a str> {
	for part in line.split(FIELD_SEP) {
		let Some(rest) = part.strip_prefix(KEY_SEP) else {
			continue;
		};
		if let Some((k, v)) = rest.split_once(KEY_SEP)
			&& k == key
		{
			return Some(v);
		}
	}
	None
}

fn require<'a>(line: &'a str, key: &'static str) -> Result<&'a str, ProtoError> {
	find_val(line, key).ok_or(ProtoError::MissingField(key))
}

fn require_u64(line: &str, key: &'static str) -> Result<u64, ProtoError> {
	let raw = require(line, key)?;
	raw.parse().map_err(|_| ProtoError::BadNumber {
		field: key,
		value: raw.to_owned(),
	})
}

fn json_field<T: serde::Serialize>(key: &'static str, value: &T) -> String {
	// serde_json escapes control characters, so the output is framing-safe.
	let json = serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned());
	field(key, &json)
}

fn require_json<T: serde::de::DeserializeOwned>(
	line: &str,
	key: &'static str,
) -> Result<T, ProtoError> {
	let raw = require(line, key)?;
	serde_json::from_str(raw).map_err(|source| ProtoError::BadJson { field: key, source })
}

impl Message {
	/// Wire tag for this message kind.
	#[must_use]
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Request { .. } => "rqs",
			Self::Receipt { .. } => "rcs",
			Self::Release { .. } => "rls",
			Self::Cut { .. } => "cut",
			Self::AppRequest => "rqa",
			Self::AppRelease { .. } => "rla",
			Self::AppDied => "apd",
			Self::StartCs => "ssa",
			Self::ApplyUpdate { .. } => "upa",
			Self::Shutdown => "shd",
			Self::SharedText { .. } => "sht",
			Self::InitialSize { .. } => "siz",
			Self::InitialText { .. } => "txt",
			Self::ReturnText { .. } => "ret",
			Self::AccessRequest { .. } => "acc",
			Self::AccessGranted { .. } => "acg",
		}
	}

	/// Encodes the message as one wire line (without trailing newline).
	#[must_use]
	pub fn encode(&self) -> String {
		let mut line = field("typ", self.kind());
		match self {
			Self::Request { site, stamp, clock } => {
				line.push_str(&field("hlg", &stamp.to_string()));
				line.push_str(&field("sid", site.as_str()));
				line.push_str(&json_field("vcl", clock));
			}
			Self::Receipt {
				site,
				dest,
				stamp,
				clock,
			} => {
				line.push_str(&field("hlg", &stamp.to_string()));
				line.push_str(&field("sid", site.as_str()));
				line.push_str(&field("did", dest.as_str()));
				line.push_str(&json_field("vcl", clock));
			}
			Self::Release {
				site,
				stamp,
				clock,
				diffs,
				admit,
				closing,
			} => {
				line.push_str(&field("hlg", &stamp.to_string()));
				line.push_str(&json_field("upt", diffs));
				line.push_str(&field("sid", site.as_str()));
				line.push_str(&json_field("vcl", clock));
				line.push_str(&json_field("adm", admit));
				if *closing {
					line.push_str(&field("cls", "1"));
				}
			}
			Self::Cut {
				cut_id,
				hops,
				site,
				clock,
			} => {
				if let Some(id) = cut_id {
					line.push_str(&field("cnb", id));
				}
				line.push_str(&field("hop", &hops.to_string()));
				if let Some(site) = site {
					line.push_str(&field("sid", site.as_str()));
				}
				if let Some(clock) = clock {
					line.push_str(&json_field("vcl", clock));
				}
			}
			Self::AppRequest | Self::AppDied | Self::StartCs | Self::Shutdown => {}
			Self::AppRelease { diffs } | Self::ApplyUpdate { diffs } => {
				line.push_str(&json_field("upt", diffs));
			}
			Self::SharedText { candidate, text } => {
				line.push_str(&field("cid", candidate.as_str()));
				if let Some(text) = text {
					line.push_str(&field("upt", &escape_text(text)));
				}
			}
			Self::InitialSize { lines } => {
				line.push_str(&field("upt", &lines.to_string()));
			}
			Self::InitialText { text } | Self::ReturnText { text } => {
				line.push_str(&field("upt", &escape_text(text)));
			}
			Self::AccessRequest { site } => {
				line.push_str(&field("sid", site.as_str()));
			}
			Self::AccessGranted {
				site,
				known,
				snapshot,
			} => {
				line.push_str(&field("sid", site.as_str()));
				line.push_str(&json_field("lst", known));
				if let Some(snapshot) = snapshot {
					line.push_str(&field("upt", &escape_text(snapshot)));
				}
			}
		}
		line
	}

	/// Parses one wire line.
	pub fn parse(line: &str) -> Result<Self, ProtoError> {
		let kind = find_val(line, "typ").ok_or(ProtoError::MissingType)?;
		match kind {
			"rqs" => Ok(Self::Request {
				site: SiteId::from(require(line, "sid")?),
				stamp: require_u64(line, "hlg")?,
				clock: require_json::<VectorClock>(line, "vcl")?,
			}),
			"rcs" => Ok(Self::Receipt {
				site: SiteId::from(require(line, "sid")?),
				dest: SiteId::from(require(line, "did")?),
				stamp: require_u64(line, "hlg")?,
				clock: require_json::<VectorClock>(line, "vcl")?,
			}),
			"rls" => Ok(Self::Release {
				site: SiteId::from(require(line, "sid")?),
				stamp: require_u64(line, "hlg")?,
				clock: require_json::<VectorClock>(line, "vcl")?,
				diffs: require_json::<Vec<Diff>>(line, "upt")?,
				admit: require_json::<Vec<SiteId>>(line, "adm")?,
				closing: find_val(line, "cls") == Some("1"),
			}),
			"cut" => Ok(Self::Cut {
				cut_id: find_val(line, "cnb").map(str::to_owned),
				hops: find_val(line, "hop")
					.map(|raw| {
						raw.parse().map_err(|_| ProtoError::BadNumber {
							field: "hop",
							value: raw.to_owned(),
						})
					})
					.transpose()?
					.unwrap_or(0),
				site: find_val(line, "sid").map(SiteId::from),
				clock: find_val(line, "vcl")
					.map(|raw| {
						serde_json::from_str(raw).map_err(|source| ProtoError::BadJson {
							field: "vcl",
							source,
						})
					})
					.transpose()?,
			}),
			"rqa" => Ok(Self::AppRequest),
			"rla" => Ok(Self::AppRelease {
				diffs: require_json::<Vec<Diff>>(line, "upt")?,
			}),
			"apd" => Ok(Self::AppDied),
			"ssa" => Ok(Self::StartCs),
			"upa" => Ok(Self::ApplyUpdate {
				diffs: require_json::<Vec<Diff>>(line, "upt")?,
			}),
			"shd" => Ok(Self::Shutdown),
			"sht" => Ok(Self::SharedText {
				candidate: SiteId::from(require(line, "cid")?),
				text: find_val(line, "upt").map(unescape_text),
			}),
			"siz" => Ok(Self::InitialSize {
				lines: require_u64(line, "upt")?,
			}),
			"txt" => Ok(Self::InitialText {
				text: unescape_text(require(line, "upt")?),
			}),
			"ret" => Ok(Self::ReturnText {
				text: unescape_text(require(line, "upt")?),
			}),
			"acc" => Ok(Self::AccessRequest {
				site: SiteId::from(require(line, "sid")?),
			}),
			"acg" => Ok(Self::AccessGranted {
				site: SiteId::from(require(line, "sid")?),
				known: require_json::<Vec<SiteId>>(line, "lst")?,
				snapshot: find_val(line, "upt").map(unescape_text),
			}),
			other => Err(ProtoError::UnknownKind(other.to_owned())),
		}
	}
}

impl Envelope {
	/// True when the line carries wave routing fields.
	#[must_use]
	pub fn is_envelope(line: &str) -> bool {
		find_val(line, "dsid").is_some()
	}

	/// Encodes the envelope as one wire line.
	///
	/// Blue lines are the payload with routing fields appended, so the
	/// payload's own `typ` stays the line's `typ`; red lines carry the
	/// `dif` kind of their own.
	#[must_use]
	pub fn encode(&self) -> String {
		let mut line = match (&self.colour, &self.payload) {
			(Colour::Blue, Some(payload)) => payload.clone(),
			_ => field("typ", "dif"),
		};
		line.push_str(&field("dsid", &self.wave.to_string()));
		line.push_str(&field("clr", self.colour.tag()));
		line.push_str(&field("fwd", self.forwarder.as_str()));
		line
	}

	/// Parses a wave line back into an envelope.
	pub fn parse(line: &str) -> Result<Self, ProtoError> {
		let wave = require(line, "dsid")?;
		let wave = WaveId::parse(wave).ok_or(ProtoError::BadEnvelope("unparseable wave id"))?;
		let colour = Colour::from_tag(require(line, "clr")?)
			.ok_or(ProtoError::BadEnvelope("unknown colour"))?;
		let forwarder = SiteId::from(require(line, "fwd")?);

		let payload = match colour {
			Colour::Red => None,
			Colour::Blue => {
				// The routing fields are always appended after the payload.
				let marker = format!("{FIELD_SEP}{KEY_SEP}dsid{KEY_SEP}");
				let end = line
					.find(&marker)
					.ok_or(ProtoError::BadEnvelope("blue line without payload"))?;
				if end == 0 {
					return Err(ProtoError::BadEnvelope("blue line without payload"));
				}
				Some(line[..end].to_owned())
			}
		};

		Ok(Self {
			wave,
			colour,
			forwarder,
			payload,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn clock(entries: &[(&str, u64)]) -> VectorClock {
		let mut vc = VectorClock::new();
		for (site, n) in entries {
			vc.0.insert(SiteId::from(*site), *n);
		}
		vc
	}

	#[test]
	fn request_round_trip() {
		let msg = Message::Request {
			site: SiteId::from("a"),
			stamp: 7,
			clock: clock(&[("a", 3), ("b", 1)]),
		};
		assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
	}

	#[test]
	fn release_round_trip_with_admissions_and_closing() {
		let msg = Message::Release {
			site: SiteId::from("a"),
			stamp: 12,
			clock: clock(&[("a", 5)]),
			diffs: vec![Diff::new(0, 2, "hi\nthere"), Diff::new(4, 0, "")],
			admit: vec![SiteId::from("c"), SiteId::from("d")],
			closing: true,
		};
		let parsed = Message::parse(&msg.encode()).unwrap();
		assert_eq!(parsed, msg);
	}

	#[test]
	fn release_without_closing_flag() {
		let msg = Message::Release {
			site: SiteId::from("a"),
			stamp: 1,
			clock: clock(&[]),
			diffs: vec![],
			admit: vec![],
			closing: false,
		};
		let line = msg.encode();
		assert!(find_val(&line, "cls").is_none());
		assert_eq!(Message::parse(&line).unwrap(), msg);
	}

	#[test]
	fn receipt_addresses_destination() {
		let msg = Message::Receipt {
			site: SiteId::from("b"),
			dest: SiteId::from("a"),
			stamp: 9,
			clock: clock(&[("b", 2)]),
		};
		let line = msg.encode();
		assert_eq!(find_val(&line, "did"), Some("a"));
		assert_eq!(Message::parse(&line).unwrap(), msg);
	}

	#[test]
	fn snapshot_text_survives_newlines() {
		let msg = Message::ReturnText {
			text: "line one\nline two\n".to_owned(),
		};
		let line = msg.encode();
		assert!(!line.contains('\n'));
		assert_eq!(Message::parse(&line).unwrap(), msg);
	}

	#[test]
	fn diff_text_with_newlines_is_framing_safe() {
		let msg = Message::AppRelease {
			diffs: vec![Diff::new(0, 0, "a\nb")],
		};
		let line = msg.encode();
		assert!(!line.contains('\n'));
		assert_eq!(Message::parse(&line).unwrap(), msg);
	}

	#[test]
	fn missing_typ_is_rejected() {
		assert!(matches!(
			Message::parse("no fields here"),
			Err(ProtoError::MissingType)
		));
	}

	#[test]
	fn unknown_kind_is_rejected() {
		let line = format!("{FIELD_SEP}{KEY_SEP}typ{KEY_SEP}zzz");
		assert!(matches!(
			Message::parse(&line),
			Err(ProtoError::UnknownKind(k)) if k == "zzz"
		));
	}

	#[test]
	fn blue_envelope_keeps_payload_parseable() {
		let payload = Message::Request {
			site: SiteId::from("a"),
			stamp: 3,
			clock: clock(&[("a", 1)]),
		};
		let env = Envelope {
			wave: WaveId {
				origin: SiteId::from("a"),
				counter: 0,
			},
			colour: Colour::Blue,
			forwarder: SiteId::from("a"),
			payload: Some(payload.encode()),
		};
		let line = env.encode();

		// The line as a whole still parses as the payload's kind.
		assert_eq!(find_val(&line, "typ"), Some("rqs"));

		let parsed = Envelope::parse(&line).unwrap();
		assert_eq!(parsed, env);
		let inner = Message::parse(parsed.payload.as_deref().unwrap()).unwrap();
		assert_eq!(inner, payload);
	}

	#[test]
	fn red_envelope_round_trip() {
		let env = Envelope {
			wave: WaveId {
				origin: SiteId::from("b"),
				counter: 4,
			},
			colour: Colour::Red,
			forwarder: SiteId::from("c"),
			payload: None,
		};
		let parsed = Envelope::parse(&env.encode()).unwrap();
		assert_eq!(parsed, env);
	}

	#[test]
	fn forwarding_rewrites_only_the_tail() {
		let payload = Message::AppRequest.encode();
		let env = Envelope {
			wave: WaveId {
				origin: SiteId::from("a"),
				counter: 1,
			},
			colour: Colour::Blue,
			forwarder: SiteId::from("a"),
			payload: Some(payload.clone()),
		};
		let relayed = Envelope {
			forwarder: SiteId::from("b"),
			..Envelope::parse(&env.encode()).unwrap()
		};
		assert_eq!(relayed.payload.as_deref(), Some(payload.as_str()));
	}
}

//! Diff computation and application over codepoint sequences.

use quill_proto::Diff;

/// Compares `old` and `new` and returns one [`Diff`] per change block.
///
/// Runs an LCS over codepoints; each maximal non-matching run becomes a
/// single diff whose `nb_deleted` covers the old-only codepoints and
/// whose `new_text` carries the new-only ones. Diffs are emitted left to
/// right with positions in `old`'s coordinate space.
#[must_use]
pub fn compute_diffs(old: &str, new: &str) -> Vec<Diff> {
	let r_old: Vec<char> = old.chars().collect();
	let r_new: Vec<char> = new.chars().collect();
	let (n_old, n_new) = (r_old.len(), r_new.len());

	// dp[i][j] holds the LCS length of r_old[i..] and r_new[j..].
	let mut dp = vec![vec![0usize; n_new + 1]; n_old + 1];
	for i in (0..n_old).rev() {
		for j in (0..n_new).rev() {
			dp[i][j] = if r_old[i] == r_new[j] {
				dp[i + 1][j + 1] + 1
			} else {
				dp[i + 1][j].max(dp[i][j + 1])
			};
		}
	}

	let mut diffs = Vec::new();
	let (mut i, mut j, mut pos) = (0, 0, 0);

	while i < n_old || j < n_new {
		if i < n_old && j < n_new && r_old[i] == r_new[j] {
			i += 1;
			j += 1;
			pos += 1;
			continue;
		}

		let start = pos;
		let mut old_len = 0;

		// Codepoints present only in the old text are deleted.
		while i < n_old && (j >= n_new || dp[i + 1][j] >= dp[i][j + 1]) {
			i += 1;
			old_len += 1;
			pos += 1;
		}

		// Codepoints present only in the new text are inserted.
		let mut inserted = String::new();
		while j < n_new && (i >= n_old || dp[i][j + 1] > dp[i + 1][j]) {
			inserted.push(r_new[j]);
			j += 1;
		}

		diffs.push(Diff::new(start, old_len, inserted));
	}

	diffs
}

/// Applies diffs in emission order.
///
/// Each diff is clamped so its position stays within the current text
/// and its deletion never runs past the end.
#[must_use]
pub fn apply_diffs_sequential(base: &str, diffs: &[Diff]) -> String {
	let mut text: Vec<char> = base.chars().collect();

	for d in diffs {
		let pos = d.pos.min(text.len());
		let deleted = d.nb_deleted.min(text.len() - pos);
		text.splice(pos..pos + deleted, d.new_text.chars());
	}

	text.into_iter().collect()
}

/// Applies diffs in reverse order.
///
/// Positions index the pre-batch text, so applying from the last diff
/// backwards keeps every earlier position valid. A position past the end
/// of the text right-pads with spaces to reach it.
#[must_use]
pub fn apply_diffs_reverse(base: &str, diffs: &[Diff]) -> String {
	let mut text: Vec<char> = base.chars().collect();

	for d in diffs.iter().rev() {
		if d.pos > text.len() {
			text.resize(d.pos, ' ');
		}
		let deleted = d.nb_deleted.min(text.len() - d.pos);
		text.splice(d.pos..d.pos + deleted, d.new_text.chars());
	}

	text.into_iter().collect()
}

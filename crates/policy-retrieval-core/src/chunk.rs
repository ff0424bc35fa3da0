//! Structure-aware text chunker with overlap and boundary merging.
//!
//! Splits a document into [`Chunk`]s of roughly `chunk_size` bytes, where
//! consecutive chunks share up to `chunk_overlap` bytes of context.
//!
//! # Algorithm
//!
//! 1. Split the text into *units*: runs of non-blank lines separated by blank
//!    lines. Heading lines (`# ...` or short ALL-CAPS lines) are units of
//!    their own.
//! 2. Mark each unit as *connected* to the next one when splitting between
//!    them would strand an unresolved reference:
//!    - the unit is a heading (a heading belongs with its body),
//!    - it ends with `:` or contains a forward reference ("see below",
//!      "as follows", "the following", ...),
//!    - the unit ends inside a list item (wrapped continuation lines
//!      included) and the next unit is another item or is indented,
//!    - both sides are table rows (`| ... |`),
//!    - the next unit starts with "(continued)" or a lowercase letter.
//! 3. Merge maximal runs of connected units into *groups*. A group is never
//!    split across chunk cores, even when it exceeds `chunk_size`.
//! 4. Unconnected units larger than `chunk_size` are hard-split at sentence
//!    or whitespace boundaries.
//! 5. Pack groups greedily into chunk cores of at most `chunk_size` bytes.
//! 6. Extend each chunk backwards into the previous core by up to
//!    `chunk_overlap` bytes, starting only at a group start or at a sentence
//!    start inside an unconnected unit.
//!
//! Chunk text is always a contiguous span of the input, so `start`/`end`
//! offsets and overlap lengths are exact.
//!
//! # Example
//!
//! ```rust
//! use policy_retrieval_core::chunk::{chunk_document, ChunkParams};
//! use policy_retrieval_core::models::RoleScope;
//!
//! let params = ChunkParams { chunk_size: 1000, chunk_overlap: 100 };
//! let chunks = chunk_document(RoleScope::Employee, "leave.md", "Hello.\n\nWorld.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Hello.\n\nWorld.");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, RoleScope};

/// Chunk sizing parameters, in bytes of UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

const FORWARD_REFERENCES: &[&str] = &[
    "see below",
    "as follows",
    "the following",
    "listed below",
    "described below",
    "set out below",
    "shown below",
    "outlined below",
    "detailed below",
];

/// Maximum length of a line considered as an ALL-CAPS heading.
const MAX_CAPS_HEADING: usize = 80;

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    heading: bool,
}

#[derive(Debug, Clone, Copy)]
struct Group {
    start: usize,
    end: usize,
    /// True when the group is a single unit with no connections on either side.
    free: bool,
}

/// Split one document into chunks.
///
/// Returns an empty vector for blank text. Chunk indices are contiguous
/// from 0 and chunk ids are deterministic in `(role, document_key, index)`.
pub fn chunk_document(
    role: RoleScope,
    document_key: &str,
    text: &str,
    params: &ChunkParams,
) -> Vec<Chunk> {
    let size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(size.saturating_sub(1));

    let units = split_units(text);
    if units.is_empty() {
        return Vec::new();
    }

    let groups = build_groups(text, &units, size);
    let cut_points = overlap_cut_points(text, &groups);
    let cores = pack_groups(&groups, size);

    let mut chunks: Vec<Chunk> = Vec::with_capacity(cores.len());
    let mut prev_core: Option<(usize, usize)> = None;

    for (index, &(core_start, core_end)) in cores.iter().enumerate() {
        let start = match prev_core {
            Some((prev_start, _)) if overlap > 0 => {
                overlap_start(core_start, prev_start, overlap, &cut_points)
            }
            _ => core_start,
        };

        let overlap_prev = match chunks.last_mut() {
            Some(prev) => {
                let shared = prev.end.saturating_sub(start);
                prev.overlap_next = shared;
                shared
            }
            None => 0,
        };

        let chunk_text = &text[start..core_end];
        chunks.push(Chunk {
            id: chunk_id(role, document_key, index),
            role,
            document_key: document_key.to_string(),
            chunk_index: index,
            text: chunk_text.to_string(),
            start,
            end: core_end,
            overlap_prev,
            overlap_next: 0,
            hash: sha256_hex(chunk_text.as_bytes()),
        });
        prev_core = Some((core_start, core_end));
    }

    chunks
}

/// Split text into units, recording byte ranges into `text`.
fn split_units(text: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let content = line.trim_end_matches(['\n', '\r']);
        let trimmed = content.trim_start();
        if trimmed.trim_end().is_empty() {
            flush_unit(&mut current, &mut units);
            continue;
        }

        let content_start = line_start + (content.len() - trimmed.len());
        let content_end = line_start + content.trim_end().len();

        if is_heading(trimmed) {
            flush_unit(&mut current, &mut units);
            units.push(Unit {
                start: content_start,
                end: content_end,
                heading: true,
            });
            continue;
        }

        current = match current {
            Some((s, _)) => Some((s, content_end)),
            None => Some((content_start, content_end)),
        };
    }
    flush_unit(&mut current, &mut units);
    units
}

fn flush_unit(current: &mut Option<(usize, usize)>, units: &mut Vec<Unit>) {
    if let Some((start, end)) = current.take() {
        units.push(Unit {
            start,
            end,
            heading: false,
        });
    }
}

fn is_heading(line: &str) -> bool {
    let line = line.trim();
    if line.starts_with('#') {
        return true;
    }
    if line.len() > MAX_CAPS_HEADING || line.starts_with('|') || is_list_item(line) {
        return false;
    }
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 2
        && letters.iter().all(|c| c.is_uppercase())
        && !line.ends_with('.')
}

fn is_list_item(line: &str) -> bool {
    let line = line.trim_start();
    if ["- ", "* ", "+ ", "• ", "– "].iter().any(|m| line.starts_with(m)) {
        return true;
    }

    // "1. ", "12) ", "a) ", "(iv) "
    let body = line.strip_prefix('(').unwrap_or(line);
    let marker_len = body
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_alphanumeric())
        .count();
    if marker_len == 0 || marker_len > 4 {
        return false;
    }
    let marker = &body[..marker_len];
    let numeric = marker.chars().all(|c| c.is_ascii_digit());
    let roman = marker
        .chars()
        .all(|c| matches!(c, 'i' | 'v' | 'x' | 'I' | 'V' | 'X'));
    let letter = marker_len == 1;
    if !(numeric || roman || letter) {
        return false;
    }
    let rest = &body[marker_len..];
    (rest.starts_with(". ") && numeric) || rest.starts_with(") ")
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

fn last_line(s: &str) -> &str {
    s.lines().last().unwrap_or("").trim()
}

/// Whether `unit` ends inside a list item. Indented lines after an item
/// are its wrapped continuation, so they are skipped on the way back.
fn ends_in_list_item(unit: &str) -> bool {
    for line in unit.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_list_item(trimmed) {
            return true;
        }
        if !line.starts_with(char::is_whitespace) {
            return false;
        }
    }
    false
}

/// Whether the boundary between `cur` and `next` must not become a chunk boundary.
///
/// `next_indented` is true when the first line of `next` is indented in the
/// source text.
fn joins_next(cur: &str, cur_heading: bool, next: &str, next_indented: bool) -> bool {
    if cur_heading || cur.trim_end().ends_with(':') {
        return true;
    }

    let lower = cur.to_lowercase();
    if FORWARD_REFERENCES.iter().any(|m| lower.contains(m)) {
        return true;
    }

    let cur_last = last_line(cur);
    let next_first = first_line(next);

    if ends_in_list_item(cur) && (is_list_item(next_first) || next_indented) {
        return true;
    }
    if cur_last.starts_with('|') && next_first.starts_with('|') {
        return true;
    }

    let next_lower = next_first.to_lowercase();
    if next_lower.starts_with("(continued)") || next_lower.starts_with("continued") {
        return true;
    }
    next_first
        .chars()
        .next()
        .map(|c| c.is_lowercase())
        .unwrap_or(false)
}

/// Whether the line containing `pos` has leading whitespace before `pos`.
fn is_indented(text: &str, pos: usize) -> bool {
    let line_start = text[..pos].rfind('\n').map_or(0, |i| i + 1);
    pos > line_start
}

/// Merge connected units into groups and hard-split oversized free units.
fn build_groups(text: &str, units: &[Unit], size: usize) -> Vec<Group> {
    let joins: Vec<bool> = units
        .windows(2)
        .map(|w| {
            joins_next(
                &text[w[0].start..w[0].end],
                w[0].heading,
                &text[w[1].start..w[1].end],
                is_indented(text, w[1].start),
            )
        })
        .collect();

    let mut groups = Vec::new();
    let mut i = 0;
    while i < units.len() {
        let first = i;
        while i < joins.len() && joins[i] {
            i += 1;
        }
        let last = i;
        let start = units[first].start;
        let end = units[last].end;

        if first == last && end - start > size {
            for (s, e) in hard_split(text, start, end, size) {
                groups.push(Group {
                    start: s,
                    end: e,
                    free: true,
                });
            }
        } else {
            groups.push(Group {
                start,
                end,
                free: first == last,
            });
        }
        i += 1;
    }
    groups
}

/// Split `text[start..end]` into pieces of at most `size` bytes, preferring
/// sentence ends, then whitespace, then any char boundary.
fn hard_split(text: &str, start: usize, end: usize, size: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut s = start;

    while end - s > size {
        let mut limit = s + size;
        while !text.is_char_boundary(limit) {
            limit -= 1;
        }
        let window = &text[s..limit];

        let cut = last_sentence_end(window)
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|&p| p > 0)
            .map(|p| s + p)
            .unwrap_or(limit);

        let piece_end = s + text[s..cut].trim_end().len();
        if piece_end > s {
            pieces.push((s, piece_end));
        }

        s = cut;
        while s < end {
            match text[s..].chars().next() {
                Some(c) if c.is_whitespace() => s += c.len_utf8(),
                _ => break,
            }
        }
        if cut == s && piece_end == s {
            break;
        }
    }
    if s < end {
        pieces.push((s, end));
    }
    pieces
}

/// Byte offset just after the last sentence terminator followed by whitespace.
fn last_sentence_end(window: &str) -> Option<usize> {
    let bytes = window.as_bytes();
    (1..bytes.len())
        .rev()
        .find(|&i| matches!(bytes[i - 1], b'.' | b'?' | b'!') && bytes[i].is_ascii_whitespace())
}

/// Positions where an overlap region may begin.
fn overlap_cut_points(text: &str, groups: &[Group]) -> Vec<usize> {
    let mut cuts = Vec::new();
    for g in groups {
        cuts.push(g.start);
        if g.free {
            let bytes = text[g.start..g.end].as_bytes();
            for i in 2..bytes.len() {
                let sentence_start = !bytes[i].is_ascii_whitespace()
                    && (bytes[i - 1] == b' ' || bytes[i - 1] == b'\n')
                    && matches!(bytes[i - 2], b'.' | b'?' | b'!');
                if sentence_start {
                    cuts.push(g.start + i);
                }
            }
        }
    }
    cuts.sort_unstable();
    cuts.dedup();
    cuts
}

fn pack_groups(groups: &[Group], size: usize) -> Vec<(usize, usize)> {
    let mut cores = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for g in groups {
        current = match current {
            None => Some((g.start, g.end)),
            Some((s, _)) if g.end - s <= size => Some((s, g.end)),
            Some(range) => {
                cores.push(range);
                Some((g.start, g.end))
            }
        };
    }
    if let Some(range) = current {
        cores.push(range);
    }
    cores
}

fn overlap_start(core_start: usize, prev_core_start: usize, overlap: usize, cuts: &[usize]) -> usize {
    let lower = core_start.saturating_sub(overlap).max(prev_core_start + 1);
    let from = cuts.partition_point(|&p| p < lower);
    match cuts.get(from) {
        Some(&p) if p < core_start => p,
        _ => core_start,
    }
}

fn chunk_id(role: RoleScope, document_key: &str, index: usize) -> String {
    let digest = sha256_hex(format!("{}\u{0}{}\u{0}{}", role, document_key, index).as_bytes());
    digest[..32].to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

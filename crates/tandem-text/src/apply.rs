#![forbid(unsafe_code)]

//! Applying and inverting alteration sequences.
//!
//! Every alteration in a sequence refers to the *same* starting text. They are
//! applied right-to-left (ordered by ascending `end`, stable), so splicing one
//! never shifts the indices of the ones still to be applied.
//!
//! Callers keep sequences sorted by `start` and non-overlapping
//! (`prev.end <= next.start`). Anything else yields unspecified output;
//! out-of-range indices are clamped rather than panicking.

use crate::alteration::TextAlteration;

/// Length of `text` in chars.
#[must_use]
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Apply `alterations` (all relative to `text`) and return the new text.
#[must_use]
pub fn perform_alterations(text: &str, alterations: &[TextAlteration]) -> String {
    if alterations.is_empty() {
        return text.to_owned();
    }

    let mut buffer: Vec<char> = text.chars().collect();
    let mut ordered: Vec<&TextAlteration> = alterations.iter().collect();
    ordered.sort_by_key(|alteration| alteration.end);

    for alteration in ordered.into_iter().rev() {
        let end = alteration.end.min(buffer.len());
        let start = alteration.start.min(end);
        buffer.splice(start..end, alteration.content.chars());
    }

    buffer.into_iter().collect()
}

/// Build the sequence that undoes `alterations`.
///
/// The result is expressed against the text produced by applying
/// `alterations`, so `perform_alterations(&perform_alterations(t, a),
/// &invert_alterations(a)?) == t`. Returns `None` if any entry lacks
/// `previous_content`.
#[must_use]
pub fn invert_alterations(alterations: &[TextAlteration]) -> Option<Vec<TextAlteration>> {
    let mut shift: isize = 0;
    let mut inverted = Vec::with_capacity(alterations.len());
    for alteration in alterations {
        let mut inverse = alteration.inverse()?;
        let start = (alteration.start as isize + shift).max(0) as usize;
        inverse.end = start + (inverse.end - inverse.start);
        inverse.start = start;
        shift += alteration.delta();
        inverted.push(inverse);
    }
    Some(inverted)
}

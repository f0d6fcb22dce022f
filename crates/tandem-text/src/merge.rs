#![forbid(unsafe_code)]

//! Merging two chained alteration sequences into one.
//!
//! Given `base` (turning `T0` into `T1`) and `alterations` (turning `T1` into
//! `T2`), [`merge_alterations`] returns a single sequence turning `T0`
//! directly into `T2`. This lets two consecutive edits be stored and undone
//! as one.
//!
//! # Algorithm
//!
//! Each base entry occupies an *image* in `T1`: it starts at its `T0` start
//! shifted by the net length delta of every base entry before it, and spans
//! its replacement content. Both sequences are scanned from the highest index
//! downward. The topmost remaining entry seeds a group; the scan then keeps
//! absorbing the next base image or edit range whose end reaches the group's
//! lower bound (touching counts). Every group becomes one output entry:
//!
//! ```text
//!   T1:  a b [X Y] f g h      base image [2, 4) from T0 range [2, 5)
//!              [Z]            edit [3, 4)
//!   group [2, 4) -> content "X" + "Z" ; T0 range [2, 5)
//! ```
//!
//! - an edit below every base image is emitted translated by the offset;
//! - a base image touched by no edit is emitted untouched;
//! - an edit overlapping a base image splices its content into the image's
//!   content, dropping the overlapped part and widening the range by any
//!   excess past the image.
//!
//! The offset (net delta of base entries below the scan position) translates
//! group bounds back into `T0`. Groups come out descending; they are reversed
//! and touching neighbours (`prev.end == next.start`) are coalesced.
//!
//! Inside a group every `T1` position not covered by an edit lies inside some
//! base image, so the merged content is built from replacement contents only;
//! the original text is never needed.
//!
//! # Preconditions
//!
//! Both inputs sorted by `start`, non-overlapping, and in range of the text
//! they apply to. Violations produce unspecified (but non-panicking in release
//! builds) output.

use crate::alteration::TextAlteration;

/// Options for [`merge_alterations_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    /// When `true` (the default) the second sequence is expressed against the
    /// text produced by the base sequence and its indices are translated back.
    ///
    /// When `false` the second sequence is expressed against the same text as
    /// the base. Its entries are first carried forward through the base: a
    /// point strictly inside a replaced base range snaps outward to the
    /// boundary of that range's replacement, and entries that end up
    /// overlapping are unioned.
    pub rebase: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { rebase: true }
    }
}

impl MergeOptions {
    /// Options for a second sequence that shares the base's starting text.
    #[must_use]
    pub fn concurrent() -> Self {
        Self { rebase: false }
    }
}

/// Merge `alterations` (applied after `base`) into one sequence against the
/// text `base` started from.
#[must_use]
pub fn merge_alterations(
    base: &[TextAlteration],
    alterations: &[TextAlteration],
) -> Vec<TextAlteration> {
    merge_alterations_with(base, alterations, MergeOptions::default())
}

/// [`merge_alterations`] with explicit [`MergeOptions`].
#[must_use]
pub fn merge_alterations_with(
    base: &[TextAlteration],
    alterations: &[TextAlteration],
    options: MergeOptions,
) -> Vec<TextAlteration> {
    let carried;
    let alterations = if options.rebase {
        alterations
    } else {
        carried = carry_forward(base, alterations);
        carried.as_slice()
    };

    let images = BaseImage::layout(base);
    let edits: Vec<EditRange<'_>> = alterations.iter().map(EditRange::new).collect();

    let mut offset: isize = images.iter().map(|image| image.delta).sum();
    let mut base_top = images.len();
    let mut edit_top = edits.len();
    let mut groups = Vec::with_capacity(images.len() + edits.len());

    while base_top > 0 || edit_top > 0 {
        let image_end = base_top.checked_sub(1).map(|i| images[i].end());
        let edit_end = edit_top.checked_sub(1).map(|i| edits[i].end);
        let upper = image_end.max(edit_end).unwrap_or(0);
        let upper_offset = offset;
        let (base_hi, edit_hi) = (base_top, edit_top);

        let mut lower = upper;
        loop {
            let mut absorbed = false;
            if base_top > 0 && images[base_top - 1].end() >= lower {
                base_top -= 1;
                let image = &images[base_top];
                lower = lower.min(image.start);
                offset -= image.delta;
                absorbed = true;
            }
            if edit_top > 0 && edits[edit_top - 1].end >= lower {
                edit_top -= 1;
                lower = lower.min(edits[edit_top].start);
                absorbed = true;
            }
            if !absorbed {
                break;
            }
        }

        let group = Group {
            lower,
            upper,
            images: &images[base_top..base_hi],
            edits: &edits[edit_top..edit_hi],
        };
        groups.push(group.compose(translate(lower, offset), translate(upper, upper_offset)));
    }

    groups.reverse();
    let merged = merge_consecutive_alterations(&groups);
    tracing::trace!(
        target: "tandem.text",
        base = base.len(),
        edits = alterations.len(),
        merged = merged.len(),
        rebase = options.rebase,
        "merged alteration sequences"
    );
    merged
}

/// Coalesce neighbours whose ranges touch (`prev.end == next.start`).
///
/// `previous_content` survives only if both neighbours carry one.
#[must_use]
pub fn merge_consecutive_alterations(alterations: &[TextAlteration]) -> Vec<TextAlteration> {
    let mut merged: Vec<TextAlteration> = Vec::with_capacity(alterations.len());
    for alteration in alterations {
        match merged.last_mut() {
            Some(last) if last.end == alteration.start => {
                last.end = alteration.end;
                last.content.push_str(&alteration.content);
                let previous = last.previous_content.take();
                last.previous_content = match (previous, &alteration.previous_content) {
                    (Some(mut previous), Some(next)) => {
                        previous.push_str(next);
                        Some(previous)
                    }
                    _ => None,
                };
            }
            _ => merged.push(alteration.clone()),
        }
    }
    merged
}

fn translate(index: usize, offset: isize) -> usize {
    (index as isize - offset).max(0) as usize
}

/// A base alteration positioned in post-base coordinates.
struct BaseImage<'a> {
    source: &'a TextAlteration,
    start: usize,
    content: Vec<char>,
    previous: Option<Vec<char>>,
    delta: isize,
}

impl<'a> BaseImage<'a> {
    fn layout(base: &'a [TextAlteration]) -> Vec<Self> {
        let mut shift: isize = 0;
        base.iter()
            .map(|source| {
                let content: Vec<char> = source.content.chars().collect();
                let delta = content.len() as isize - source.removed_len() as isize;
                let image = Self {
                    source,
                    start: (source.start as isize + shift).max(0) as usize,
                    content,
                    previous: source.previous_content.as_ref().map(|p| p.chars().collect()),
                    delta,
                };
                shift += delta;
                image
            })
            .collect()
    }

    fn end(&self) -> usize {
        self.start + self.content.len()
    }
}

/// A second-sequence alteration, already in post-base coordinates.
struct EditRange<'a> {
    source: &'a TextAlteration,
    start: usize,
    end: usize,
    previous: Option<Vec<char>>,
}

impl<'a> EditRange<'a> {
    fn new(source: &'a TextAlteration) -> Self {
        Self {
            source,
            start: source.start,
            end: source.end,
            previous: source.previous_content.as_ref().map(|p| p.chars().collect()),
        }
    }
}

/// Connected base images and edits spanning `[lower, upper)` of `T1`.
struct Group<'g, 'a> {
    lower: usize,
    upper: usize,
    images: &'g [BaseImage<'a>],
    edits: &'g [EditRange<'a>],
}

impl Group<'_, '_> {
    fn compose(&self, start: usize, end: usize) -> TextAlteration {
        if let ([image], []) = (self.images, self.edits) {
            return image.source.clone();
        }

        let mut content = String::new();
        let mut cursor = self.lower;
        for edit in self.edits {
            if edit.start > cursor {
                content.extend(self.image_chars(cursor, edit.start));
            }
            content.push_str(&edit.source.content);
            cursor = cursor.max(edit.end);
        }
        if self.upper > cursor {
            content.extend(self.image_chars(cursor, self.upper));
        }

        TextAlteration {
            start,
            end,
            content,
            previous_content: self.previous_content(),
        }
    }

    /// Replacement chars of the base images overlapping `[from, to)`.
    fn image_chars(&self, from: usize, to: usize) -> Vec<char> {
        let pieces = self
            .images
            .iter()
            .map(|image| (image.start, image.content.as_slice()));
        let chars = covered_slice(pieces, from, to);
        debug_assert_eq!(chars.len(), to - from, "edit group has an uncovered gap");
        chars
    }

    /// Original text of the group, rebuilt from base `previous_content` and
    /// the edits' `previous_content` for stretches outside any base image.
    fn previous_content(&self) -> Option<String> {
        let mut previous = String::new();
        let mut cursor = self.lower;
        for image in self.images {
            if image.start > cursor {
                previous.extend(self.original_chars(cursor, image.start)?);
            }
            previous.extend(image.previous.as_ref()?.iter());
            cursor = cursor.max(image.end());
        }
        if self.upper > cursor {
            previous.extend(self.original_chars(cursor, self.upper)?);
        }
        Some(previous)
    }

    fn original_chars(&self, from: usize, to: usize) -> Option<Vec<char>> {
        let mut pieces = Vec::with_capacity(self.edits.len());
        for edit in self.edits {
            if edit.end <= from || edit.start >= to {
                continue;
            }
            pieces.push((edit.start, edit.previous.as_deref()?));
        }
        let chars = covered_slice(pieces.into_iter(), from, to);
        (chars.len() == to - from).then_some(chars)
    }
}

/// Collect the chars of `pieces` (each `(start, chars)` in a shared
/// coordinate space) that fall inside `[from, to)`.
fn covered_slice<'c>(
    pieces: impl Iterator<Item = (usize, &'c [char])>,
    from: usize,
    to: usize,
) -> Vec<char> {
    let mut out = Vec::with_capacity(to.saturating_sub(from));
    for (start, chars) in pieces {
        let end = start + chars.len();
        let lo = from.max(start);
        let hi = to.min(end);
        if lo < hi {
            out.extend_from_slice(&chars[lo - start..hi - start]);
        }
    }
    out
}

#[derive(Clone, Copy)]
enum Bias {
    Left,
    Right,
}

/// Carry base-relative alterations forward into post-base coordinates.
fn carry_forward(base: &[TextAlteration], alterations: &[TextAlteration]) -> Vec<TextAlteration> {
    let mut carried: Vec<TextAlteration> = Vec::with_capacity(alterations.len());
    for alteration in alterations {
        let start = carry_point(base, alteration.start, Bias::Left);
        let end = if alteration.start == alteration.end {
            start
        } else {
            carry_point(base, alteration.end, Bias::Right).max(start)
        };
        let next = TextAlteration::new(start, end, alteration.content.clone());
        match carried.last_mut() {
            Some(last) if next.start < last.end => {
                last.end = last.end.max(next.end);
                last.content.push_str(&next.content);
            }
            _ => carried.push(next),
        }
    }
    carried
}

fn carry_point(base: &[TextAlteration], index: usize, bias: Bias) -> usize {
    let mut shift: isize = 0;
    for entry in base {
        let zero_width = entry.start == entry.end;
        let at_start = index == entry.start && (!zero_width || matches!(bias, Bias::Left));
        if index < entry.start || at_start {
            break;
        }
        let image_start = (entry.start as isize + shift).max(0) as usize;
        if index < entry.end {
            return match bias {
                Bias::Left => image_start,
                Bias::Right => image_start + entry.inserted_len(),
            };
        }
        shift += entry.delta();
    }
    (index as isize + shift).max(0) as usize
}

#![forbid(unsafe_code)]

//! Value types describing text-range replacements and selections.
//!
//! # Invariants
//!
//! 1. `start <= end` for every alteration and selection.
//! 2. When present, `previous_content` is exactly the text that `[start, end)`
//!    covered before the change. It is carried along for revert and audit and
//!    is never re-derived from the current text.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::apply::char_len;

/// One contiguous replacement of `[start, end)` by `content`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextAlteration {
    /// First replaced char index (inclusive).
    pub start: usize,
    /// Last replaced char index (exclusive).
    pub end: usize,
    /// Replacement text.
    pub content: String,
    /// Text that `[start, end)` held before the change, if recorded.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub previous_content: Option<String>,
}

impl TextAlteration {
    /// Create an alteration replacing `[start, end)` with `content`.
    #[must_use]
    pub fn new(start: usize, end: usize, content: impl Into<String>) -> Self {
        debug_assert!(start <= end, "alteration start {start} > end {end}");
        Self {
            start,
            end,
            content: content.into(),
            previous_content: None,
        }
    }

    /// Pure insertion of `content` at `at`.
    #[must_use]
    pub fn insert(at: usize, content: impl Into<String>) -> Self {
        Self::new(at, at, content)
    }

    /// Pure deletion of `[start, end)`.
    #[must_use]
    pub fn delete(start: usize, end: usize) -> Self {
        Self::new(start, end, String::new())
    }

    /// Create an alteration against `text`, recording the replaced slice as
    /// `previous_content`. Out-of-range indices are clamped to the text.
    #[must_use]
    pub fn captured(text: &str, start: usize, end: usize, content: impl Into<String>) -> Self {
        let len = char_len(text);
        let end = end.min(len);
        let start = start.min(end);
        let previous: String = text.chars().skip(start).take(end - start).collect();
        Self::new(start, end, content).with_previous_content(previous)
    }

    /// Attach the replaced text.
    #[must_use]
    pub fn with_previous_content(mut self, previous: impl Into<String>) -> Self {
        self.previous_content = Some(previous.into());
        self
    }

    /// Number of chars removed from the text before the change.
    #[must_use]
    pub fn removed_len(&self) -> usize {
        self.end - self.start
    }

    /// Number of chars written by this alteration.
    #[must_use]
    pub fn inserted_len(&self) -> usize {
        char_len(&self.content)
    }

    /// Net change in text length.
    #[must_use]
    pub fn delta(&self) -> isize {
        self.inserted_len() as isize - self.removed_len() as isize
    }

    /// Whether this alteration inserts nothing and removes nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.start == self.end && self.content.is_empty()
    }

    /// The alteration that undoes this one when applied to the text produced
    /// by it. Requires `previous_content`.
    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        let previous = self.previous_content.as_ref()?;
        Some(Self {
            start: self.start,
            end: self.start + self.inserted_len(),
            content: previous.clone(),
            previous_content: Some(self.content.clone()),
        })
    }
}

impl fmt::Display for TextAlteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}) -> {:?}", self.start, self.end, self.content)
    }
}

impl<S: Into<String>> From<(usize, usize, S)> for TextAlteration {
    fn from((start, end, content): (usize, usize, S)) -> Self {
        Self::new(start, end, content)
    }
}

/// A selected char range. `start == end` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    /// Selection of `[start, end)`; the bounds are reordered if reversed.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Collapsed selection at `at`.
    #[must_use]
    pub const fn caret(at: usize) -> Self {
        Self { start: at, end: at }
    }

    /// Caret placed right after the content written by `alteration`.
    #[must_use]
    pub fn after(alteration: &TextAlteration) -> Self {
        Self::caret(alteration.start + alteration.inserted_len())
    }

    #[must_use]
    pub const fn is_caret(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.is_caret()
    }

    /// Clamp both bounds into a text of `len` chars.
    #[must_use]
    pub fn clamp(self, len: usize) -> Self {
        Self::new(self.start.min(len), self.end.min(len))
    }
}

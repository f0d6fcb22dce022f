#![forbid(unsafe_code)]

//! Tandem text alteration primitives.
//!
//! A [`TextAlteration`] describes one contiguous replacement inside a text:
//! the half-open range `[start, end)` of the text *before* the change is
//! replaced by `content`. Indices count Unicode scalar values (`char`s), never
//! bytes, so alterations stay valid for any UTF-8 input.
//!
//! # Key Operations
//!
//! - [`perform_alterations`] applies a sequence of alterations that all refer
//!   to the same starting text.
//! - [`merge_alterations`] combines two temporally chained sequences (the
//!   second one expressed against the output of the first) into a single
//!   sequence against the original text.
//! - [`merge_consecutive_alterations`] coalesces entries whose ranges touch.
//! - [`invert_alterations`] builds the sequence that undoes a recorded one.
//!
//! # Example
//!
//! ```
//! use tandem_text::{merge_alterations, perform_alterations, TextAlteration};
//!
//! let text = "abcdefghij";
//! let base = vec![TextAlteration::new(2, 5, "XY")];
//! let next = vec![TextAlteration::new(3, 4, "Z")];
//!
//! let step = perform_alterations(text, &base);
//! assert_eq!(step, "abXYfghij");
//! assert_eq!(perform_alterations(&step, &next), "abXZfghij");
//!
//! let merged = merge_alterations(&base, &next);
//! assert_eq!(perform_alterations(text, &merged), "abXZfghij");
//! ```
//!
//! # Role in Tandem
//! `tandem-text` is pure: no async, no locking. `tandem-runtime` builds its
//! text edit commands on top of these functions.

pub mod alteration;
pub mod apply;
pub mod merge;

pub use alteration::{Selection, TextAlteration};
pub use apply::{char_len, invert_alterations, perform_alterations};
pub use merge::{
    MergeOptions, merge_alterations, merge_alterations_with, merge_consecutive_alterations,
};

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tandem_text::{TextAlteration, char_len, merge_alterations, perform_alterations};

#[derive(Debug, Arbitrary)]
struct Edit {
    a: u8,
    b: u8,
    content: String,
}

#[derive(Debug, Arbitrary)]
struct Input {
    text: String,
    base: Vec<Edit>,
    next: Vec<Edit>,
}

/// Fold raw edits into a sorted, non-overlapping sequence for a text of `len` chars.
fn normalize(edits: &[Edit], len: usize) -> Vec<TextAlteration> {
    let mut points: Vec<usize> = edits
        .iter()
        .take(8)
        .flat_map(|e| [e.a as usize % (len + 1), e.b as usize % (len + 1)])
        .collect();
    points.sort_unstable();
    points
        .chunks_exact(2)
        .zip(edits)
        .map(|(bounds, e)| {
            let content: String = e.content.chars().take(8).collect();
            TextAlteration::new(bounds[0], bounds[1], content)
        })
        .collect()
}

fuzz_target!(|input: Input| {
    // Cap length to keep fuzzing fast.
    if input.text.chars().count() > 256 {
        return;
    }

    let base = normalize(&input.base, char_len(&input.text));
    let step = perform_alterations(&input.text, &base);
    let next = normalize(&input.next, char_len(&step));
    let expected = perform_alterations(&step, &next);

    let merged = merge_alterations(&base, &next);
    assert_eq!(
        perform_alterations(&input.text, &merged),
        expected,
        "merged sequence diverges: base={base:?} next={next:?}"
    );

    // Output must be sorted with no touching neighbours.
    for pair in merged.windows(2) {
        assert!(pair[0].end < pair[1].start, "unsorted or touching: {pair:?}");
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_text::{TextAlteration, char_len, invert_alterations, perform_alterations};

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let Ok(text) = std::str::from_utf8(&data[3..]) else {
        return;
    };
    let len = char_len(text);

    // Out-of-range bounds must never panic.
    let (lo, hi) = (data[0].min(data[1]) as usize, data[0].max(data[1]) as usize);
    let raw = TextAlteration::new(lo, hi, "~");
    let _ = perform_alterations(text, std::slice::from_ref(&raw));

    let start = data[0] as usize % (len + 1);
    let end = (start + data[2] as usize % 4).min(len);
    let recorded = [TextAlteration::captured(text, start, end, "ab")];
    let altered = perform_alterations(text, &recorded);
    assert_eq!(char_len(&altered), len - (end - start) + 2);

    let inverse = invert_alterations(&recorded).expect("captured alterations invert");
    assert_eq!(perform_alterations(&altered, &inverse), text);
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use riptide_proto::varint;

fuzz_target!(|value: usize| {
    let Ok((first, second)) = varint::encode(value) else {
        return;
    };
    let decoded = match second {
        None => varint::decode_single(first),
        Some(second) => varint::decode_extended(first, second),
    };
    assert_eq!(value, decoded);
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use riptide_proto::header::Header;

fuzz_target!(|data: &[u8]| {
    let _ = Header::decode(data);
});

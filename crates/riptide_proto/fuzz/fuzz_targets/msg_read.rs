#![no_main]

use libfuzzer_sys::fuzz_target;
use riptide_proto::{
    header::Header,
    msg::{MAX_SIZE, Message},
};

fuzz_target!(|data: &[u8]| {
    let Ok(header) = Header::decode(data) else {
        return;
    };
    let Ok(mut msg) = Message::from_datagram(header.tag, data, MAX_SIZE) else {
        return;
    };
    let _ = msg.read::<u16>();
    let _ = msg.read::<Vec<bool>>();
    let _ = msg.read::<String>();
    let _ = msg.read::<Vec<u64>>();
});

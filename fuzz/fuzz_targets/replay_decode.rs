#![no_main]

use hetrace::replay::parse_events;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = parse_events(data);
});

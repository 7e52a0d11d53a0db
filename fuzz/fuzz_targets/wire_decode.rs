#![no_main]

use libfuzzer_sys::fuzz_target;
use vrcluster_mux::wire;

fuzz_target!(|data: &[u8]| {
    let _ = wire::decode(data);
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use rtmac::{fuzz::FuzzFrame, tdma::MAX_DATA_LEN};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = FuzzFrame::deserialize(data) else {
        return;
    };

    // Everything that decodes must encode again, to the same frame
    let mut buffer = [0u8; MAX_DATA_LEN];
    let len = frame.serialize(&mut buffer).unwrap();
    let again = FuzzFrame::deserialize(&buffer[..len]).unwrap();
    assert_eq!(frame, again);
    assert_eq!(frame.frame_id(), again.frame_id());
});

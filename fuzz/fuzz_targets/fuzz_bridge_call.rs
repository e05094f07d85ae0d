#![no_main]
use libfuzzer_sys::fuzz_target;
use poolfs::core::bridge::{Call, Response};

fuzz_target!(|data: &[u8]| {
    // Whatever decodes must encode back to an equal call
    if let Ok(call) = serde_json::from_slice::<Call>(data) {
        let bytes = serde_json::to_vec(&call).unwrap();
        let again: Call = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(again, call);
    }
    if let Ok(response) = serde_json::from_slice::<Response>(data) {
        let _ = response.into_result::<serde_json::Value>();
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Unknown tags, malformed payloads and non-JSON must all be handled
        // without panicking; recognized snapshots must normalize cleanly.
        if let Ok(Some(teamsync_client::protocol::StreamFrame::UsersList(members))) =
            teamsync_client::protocol::StreamFrame::parse(text)
        {
            let _ = teamsync_client::model::normalize_members(&members, None, "seed:");
        }
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;
use teamsync_client::protocol::{JoinResponse, RemoteRoom};

fuzz_target!(|data: &[u8]| {
    if let Ok(rooms) = serde_json::from_slice::<Vec<RemoteRoom>>(data) {
        for room in &rooms {
            let _ = room.includes("1");
            let _ = teamsync_client::model::normalize_members(
                &room.members,
                room.leader_id.as_deref(),
                "seed:",
            );
        }
    }

    if let Ok(response) = serde_json::from_slice::<JoinResponse>(data) {
        let _ = response.into_outcome();
    }
});

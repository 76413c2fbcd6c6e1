#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire fixture tests for the TeamSync client.
//!
//! The JSON below mirrors what the matchmaking backend and the room stream
//! actually send, extra fields included, and the persisted record format
//! that has to stay readable across releases.

use serde_json::json;
use teamsync_client::model::{normalize_members, MessageOrigin, RoomLifecycle};
use teamsync_client::protocol::{
    JoinOutcome, JoinResponse, OutboundFrame, QueueStatus, RemoteRoom, StreamFrame,
};
use teamsync_client::{MemberRole, RoomSession, SessionStatus, UserIdentity};

// ════════════════════════════════════════════════════════════════════
// Matchmaking responses
// ════════════════════════════════════════════════════════════════════

#[test]
fn join_response_last_member_in_fills_the_room() {
    let body = json!({
        "message": "Team formed",
        "room_id": 31,
        "leader_id": 4,
        "room": {
            "id": 31,
            "name": "Team 31",
            "leader_id": 4,
            "status": "active",
            "created_at": "2024-11-02T10:15:00",
            "room_members": [
                {"id": 101, "room_id": 31, "user": {"id": 4, "username": "rani", "name": "Rani"}},
                {"id": 102, "room_id": 31, "user": {"id": 9, "username": "budi", "name": "Budi"}}
            ]
        }
    });
    let response: JoinResponse = serde_json::from_value(body).unwrap();

    let JoinOutcome::Matched {
        room_id,
        leader_id,
        room,
    } = response.into_outcome()
    else {
        panic!("expected an immediate match");
    };
    assert_eq!(room_id, "31");
    assert_eq!(leader_id.as_deref(), Some("4"));

    let room = room.unwrap();
    let members = normalize_members(&room.members, leader_id.as_deref(), "seed:");
    let ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["4", "9"]);
    assert_eq!(members[0].role, MemberRole::Leader);
    assert_eq!(members[0].display_name, "Rani");
    assert_eq!(members[1].handle, "budi");
    assert_eq!(members[1].avatar_ref, "seed:budi");
}

#[test]
fn join_response_waiting_in_queue() {
    let body = json!({"message": "Added to queue", "status": "waiting", "position": 3});
    let response: JoinResponse = serde_json::from_value(body).unwrap();
    assert_eq!(response.into_outcome(), JoinOutcome::Queued);
}

#[test]
fn join_response_without_status_or_room_is_unrecognized() {
    let response: JoinResponse =
        serde_json::from_value(json!({"message": "ok", "room_id": null})).unwrap();
    assert_eq!(response.into_outcome(), JoinOutcome::Unrecognized);
}

#[test]
fn queue_status_fixtures() {
    let idle: QueueStatus = serde_json::from_value(json!({"status": "idle"})).unwrap();
    assert_eq!(idle.matched_room(), None);

    let waiting: QueueStatus =
        serde_json::from_value(json!({"status": "waiting", "queue_size": 2})).unwrap();
    assert_eq!(waiting.matched_room(), None);

    let matched: QueueStatus =
        serde_json::from_value(json!({"status": "MATCHED", "room_id": 31})).unwrap();
    assert_eq!(matched.matched_room(), Some("31"));
}

// ════════════════════════════════════════════════════════════════════
// Room listings
// ════════════════════════════════════════════════════════════════════

#[test]
fn room_list_with_mixed_member_shapes() {
    let body = json!([
        {"id": 1, "leader_id": 2, "members": null},
        {"id": 2, "leader_id": 5, "members": [
            {"id": 5, "name": "Eko"},
            {"user_id": 6, "username": "fajar"}
        ]},
        {"id": 3, "leader_id": 7, "room_members": [
            {"id": 300, "user": {"id": 8, "username": "gita"}}
        ]}
    ]);
    let rooms: Vec<RemoteRoom> = serde_json::from_value(body).unwrap();

    assert!(rooms[0].members.is_empty());
    assert!(rooms[0].includes("2"));
    assert!(rooms[1].includes("6"));
    assert!(rooms[2].includes("8"));
    assert!(!rooms[2].includes("300"));
    assert!(!rooms[2].includes("1"));

    let members = normalize_members(&rooms[1].members, rooms[1].leader_id.as_deref(), "seed:");
    assert_eq!(members[0].display_name, "Eko");
    assert_eq!(members[0].role, MemberRole::Leader);
    assert_eq!(members[1].display_name, "fajar");
    assert_eq!(members[1].role, MemberRole::Member);
}

#[test]
fn duplicate_member_records_collapse() {
    let room: RemoteRoom = serde_json::from_value(json!({
        "id": "r",
        "members": [
            {"user_id": "u1", "username": "ana"},
            {"id": "u1", "name": "Ana again"},
            {"name": "no id at all"}
        ]
    }))
    .unwrap();
    let members = normalize_members(&room.members, None, "seed:");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].handle, "ana");
}

// ════════════════════════════════════════════════════════════════════
// Room stream frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn users_list_frame_from_server() {
    let raw = concat!(
        r#"{"type":"users_list","data":["#,
        r#"{"user_id":4,"username":"rani"},{"user_id":9,"username":"budi"}]}"#,
    );
    let Some(StreamFrame::UsersList(remote)) = StreamFrame::parse(raw).unwrap() else {
        panic!("expected users_list");
    };
    let members = normalize_members(&remote, Some("9"), "seed:");
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].display_name, "rani");
    assert_eq!(members[1].role, MemberRole::Leader);
}

#[test]
fn users_list_with_null_data_is_an_empty_snapshot() {
    let frame = StreamFrame::parse(r#"{"type":"users_list","data":null}"#).unwrap();
    assert_eq!(frame, Some(StreamFrame::UsersList(Vec::new())));
}

#[test]
fn chat_frame_from_server() {
    let raw = concat!(
        r#"{"type":"chat","data":"#,
        r#"{"user_id":4,"username":"rani","text":"halo tim","sent_at":"10:15"}}"#,
    );
    let Some(StreamFrame::Chat(payload)) = StreamFrame::parse(raw).unwrap() else {
        panic!("expected chat");
    };
    assert_eq!(payload.user_id, "4");
    assert_eq!(payload.username.as_deref(), Some("rani"));
    assert_eq!(payload.text, "halo tim");
}

#[test]
fn chat_frame_missing_text_is_an_error() {
    assert!(StreamFrame::parse(r#"{"type":"chat","data":{"user_id":4}}"#).is_err());
}

#[test]
fn unknown_frames_are_skipped() {
    for raw in [
        r#"{"type":"typing","data":{"user_id":4}}"#,
        r#"{"type":"system"}"#,
        r#"{"type":"user_joined","data":[1,2,3]}"#,
    ] {
        assert_eq!(StreamFrame::parse(raw).unwrap(), None, "{raw}");
    }
}

#[test]
fn outbound_chat_frame() {
    let text = OutboundFrame::Chat {
        text: "siap \"deploy\"".into(),
    }
    .to_json()
    .unwrap();
    assert_eq!(text, r#"{"type":"chat","text":"siap \"deploy\""}"#);
}

// ════════════════════════════════════════════════════════════════════
// Persisted records
// ════════════════════════════════════════════════════════════════════

#[test]
fn persisted_session_format() {
    let room: RemoteRoom = serde_json::from_value(json!({
        "id": 31,
        "leader_id": 4,
        "members": [{"user_id": 4, "username": "rani"}]
    }))
    .unwrap();
    let members = normalize_members(&room.members, room.leader_id.as_deref(), "seed:");
    let session = RoomSession::new(room.id, room.leader_id, members);

    let value = serde_json::to_value(&session).unwrap();
    assert_eq!(
        value,
        json!({
            "roomId": "31",
            "leaderId": "4",
            "members": [{
                "id": "4",
                "displayName": "rani",
                "handle": "rani",
                "role": "leader",
                "avatarRef": "seed:rani"
            }],
            "status": "active"
        })
    );
}

#[test]
fn persisted_session_with_only_room_id_still_loads() {
    let session: RoomSession = serde_json::from_value(json!({"roomId": "31"})).unwrap();
    assert_eq!(session.room_id, "31");
    assert_eq!(session.leader_id, None);
    assert!(session.members.is_empty());
    assert_eq!(session.status, RoomLifecycle::Active);
}

#[test]
fn stored_user_record_accepts_numeric_id() {
    let user: UserIdentity = serde_json::from_value(json!({
        "id": 4,
        "username": "rani",
        "email": "rani@example.com",
        "name": "Rani"
    }))
    .unwrap();
    assert_eq!(user.id, "4");
    assert_eq!(user.name.as_deref(), Some("Rani"));
}

#[test]
fn enum_wire_names() {
    assert_eq!(serde_json::to_value(SessionStatus::Searching).unwrap(), json!("searching"));
    assert_eq!(serde_json::to_value(MessageOrigin::Own).unwrap(), json!("self"));
    assert_eq!(serde_json::to_value(MessageOrigin::Peer).unwrap(), json!("peer"));
    assert_eq!(serde_json::to_value(RoomLifecycle::Ended).unwrap(), json!("ended"));
}

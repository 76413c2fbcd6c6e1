//! Wire types for the matchmaking backend and the room stream endpoint.
//!
//! The backend is loose about shapes: ids arrive as strings or integers,
//! members are sometimes flat (`{id, name}` / `{user_id, username}`) and
//! sometimes nested under `user`, and `members` may be `null`. Everything in
//! this module accepts those variations; [`crate::model::normalize_members`]
//! turns them into the canonical [`Member`](crate::model::Member) shape.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TeamSyncError};

// ── Type aliases ────────────────────────────────────────────────────

/// Opaque identifier for a room, stable for the room's lifetime.
pub type RoomId = String;

/// Opaque identifier for a user.
pub type UserId = String;

// ── Flexible field decoding ─────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

/// Decode a required id that may be a JSON string or number.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    RawId::deserialize(d).map(RawId::into_string)
}

/// Decode an optional id that may be a JSON string, number, or null.
pub(crate) fn de_opt_id<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(RawId::into_string))
}

fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

// ── Rooms and members ───────────────────────────────────────────────

/// A member record as the backend sends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteMember {
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    #[serde(
        default,
        alias = "userId",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Nested user record used by membership-table responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Box<RemoteMember>>,
}

impl RemoteMember {
    /// The id of the user this record describes.
    ///
    /// A nested `user` wins over `user_id`, which wins over `id` (in nested
    /// shapes the outer `id` is the membership row, not the user).
    pub fn member_id(&self) -> Option<&str> {
        self.user
            .as_deref()
            .and_then(RemoteMember::member_id)
            .or(self.user_id.as_deref())
            .or(self.id.as_deref())
    }

    /// The username, looking through a nested `user` first.
    pub fn handle(&self) -> Option<&str> {
        self.user
            .as_deref()
            .and_then(RemoteMember::handle)
            .or(self.username.as_deref())
    }

    /// The display name, looking through a nested `user` first.
    pub fn display_name(&self) -> Option<&str> {
        self.user
            .as_deref()
            .and_then(RemoteMember::display_name)
            .or(self.name.as_deref())
    }

    /// Returns `true` if this record describes `user_id`.
    ///
    /// Resolves the id like [`member_id`](Self::member_id), so the row id of
    /// a nested record never matches.
    pub fn refers_to(&self, user_id: &str) -> bool {
        self.member_id() == Some(user_id)
    }
}

/// A room as returned by `GET /rooms/`, `GET /rooms/my` and `GET /rooms/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRoom {
    #[serde(deserialize_with = "de_id")]
    pub id: RoomId,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<UserId>,
    #[serde(default, alias = "room_members", deserialize_with = "null_as_default")]
    pub members: Vec<RemoteMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl RemoteRoom {
    /// Returns `true` if `user_id` leads this room or appears in its members.
    pub fn includes(&self, user_id: &str) -> bool {
        self.leader_id.as_deref() == Some(user_id)
            || self.members.iter().any(|m| m.refers_to(user_id))
    }
}

// ── Matchmaking ─────────────────────────────────────────────────────

/// Body of `POST /matchmaking/join`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RemoteRoom>,
}

/// What a join response means for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// The backend placed us in a room straight away.
    Matched {
        room_id: RoomId,
        leader_id: Option<UserId>,
        room: Option<RemoteRoom>,
    },
    /// We are in the queue; discovery has to find the room.
    Queued,
    /// The response did not match any known shape. Treated like `Queued`.
    Unrecognized,
}

impl JoinResponse {
    /// Normalize the response into a [`JoinOutcome`].
    pub fn into_outcome(self) -> JoinOutcome {
        let room_id = self
            .room_id
            .or_else(|| self.room.as_ref().map(|room| room.id.clone()));
        if let Some(room_id) = room_id {
            let leader_id = self
                .leader_id
                .or_else(|| self.room.as_ref().and_then(|room| room.leader_id.clone()));
            return JoinOutcome::Matched {
                room_id,
                leader_id,
                room: self.room,
            };
        }
        match self.status.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("waiting" | "queued" | "searching") => JoinOutcome::Queued,
            _ => JoinOutcome::Unrecognized,
        }
    }
}

/// Body of `GET /matchmaking/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "de_opt_id", skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

impl QueueStatus {
    /// The room id, but only when the status says we are matched.
    pub fn matched_room(&self) -> Option<&str> {
        if self.status.eq_ignore_ascii_case("matched") {
            self.room_id.as_deref()
        } else {
            None
        }
    }
}

// ── Stream frames ───────────────────────────────────────────────────

/// Payload of an inbound `chat` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(alias = "userId", deserialize_with = "de_id")]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub text: String,
}

/// A recognized inbound frame from the room stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Full membership snapshot; replaces the member list.
    UsersList(Vec<RemoteMember>),
    /// One chat line.
    Chat(ChatPayload),
}

#[derive(Deserialize)]
struct TaggedFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl StreamFrame {
    /// Parse one inbound text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames with an unrecognized `type`.
    ///
    /// # Errors
    ///
    /// Returns [`TeamSyncError::Serialization`] if the text is not a tagged
    /// JSON object, or a known tag carries a malformed payload.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let frame: TaggedFrame = serde_json::from_str(text)?;
        match frame.kind.as_str() {
            "users_list" => {
                let members: Option<Vec<RemoteMember>> = serde_json::from_value(frame.data)?;
                Ok(Some(Self::UsersList(members.unwrap_or_default())))
            }
            "chat" => Ok(Some(Self::Chat(serde_json::from_value(frame.data)?))),
            _ => Ok(None),
        }
    }
}

/// Frames the client sends over the room stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// A chat line from the local user.
    Chat { text: String },
}

impl OutboundFrame {
    /// Serialize the frame to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(TeamSyncError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_become_strings() {
        let room: RemoteRoom =
            serde_json::from_value(json!({"id": 17, "leader_id": 3, "members": null})).unwrap();
        assert_eq!(room.id, "17");
        assert_eq!(room.leader_id.as_deref(), Some("3"));
        assert!(room.members.is_empty());
    }

    #[test]
    fn nested_member_prefers_inner_user_id() {
        let member: RemoteMember = serde_json::from_value(json!({
            "id": 900,
            "user": {"id": 5, "username": "dina", "name": "Dina"}
        }))
        .unwrap();
        assert_eq!(member.member_id(), Some("5"));
        assert_eq!(member.handle(), Some("dina"));
        assert_eq!(member.display_name(), Some("Dina"));
        assert!(member.refers_to("5"));
        assert!(!member.refers_to("900"));
    }

    #[test]
    fn membership_row_id_does_not_place_a_user_in_the_room() {
        let room: RemoteRoom = serde_json::from_value(json!({
            "id": 31,
            "room_members": [
                {"id": 101, "user": {"id": 4}},
                {"id": 102, "user": {"id": 9}}
            ]
        }))
        .unwrap();
        assert!(room.includes("4"));
        assert!(room.includes("9"));
        assert!(!room.includes("101"));
        assert!(!room.includes("102"));
    }

    #[test]
    fn room_includes_leader_and_members() {
        let room: RemoteRoom = serde_json::from_value(json!({
            "id": "r1",
            "leader_id": "u1",
            "room_members": [{"user_id": "u2"}]
        }))
        .unwrap();
        assert!(room.includes("u1"));
        assert!(room.includes("u2"));
        assert!(!room.includes("u3"));
    }

    #[test]
    fn join_outcome_classification() {
        let direct: JoinResponse =
            serde_json::from_value(json!({"room_id": 9, "leader_id": "u1"})).unwrap();
        assert_eq!(
            direct.into_outcome(),
            JoinOutcome::Matched {
                room_id: "9".into(),
                leader_id: Some("u1".into()),
                room: None
            }
        );

        let nested: JoinResponse = serde_json::from_value(json!({
            "status": "matched",
            "room": {"id": "r2", "leader_id": "u4"}
        }))
        .unwrap();
        match nested.into_outcome() {
            JoinOutcome::Matched {
                room_id, leader_id, ..
            } => {
                assert_eq!(room_id, "r2");
                assert_eq!(leader_id.as_deref(), Some("u4"));
            }
            other => panic!("expected Matched, got {other:?}"),
        }

        let waiting: JoinResponse = serde_json::from_value(json!({"status": "Waiting"})).unwrap();
        assert_eq!(waiting.into_outcome(), JoinOutcome::Queued);

        let odd: JoinResponse = serde_json::from_value(json!({"message": "ok"})).unwrap();
        assert_eq!(odd.into_outcome(), JoinOutcome::Unrecognized);
    }

    #[test]
    fn queue_status_requires_matched_state() {
        let idle: QueueStatus =
            serde_json::from_value(json!({"status": "idle", "room_id": "r1"})).unwrap();
        assert_eq!(idle.matched_room(), None);
        let matched: QueueStatus =
            serde_json::from_value(json!({"status": "matched", "room_id": 4})).unwrap();
        assert_eq!(matched.matched_room(), Some("4"));
    }

    #[test]
    fn stream_frames_parse_and_unknown_tags_are_ignored() {
        let users = StreamFrame::parse(concat!(
            r#"{"type":"users_list","data":["#,
            r#"{"user_id":1,"username":"ana"},{"id":"2","name":"Bo"}]}"#,
        ))
        .unwrap()
        .unwrap();
        match users {
            StreamFrame::UsersList(members) => assert_eq!(members.len(), 2),
            other => panic!("expected UsersList, got {other:?}"),
        }

        let chat = StreamFrame::parse(
            r#"{"type":"chat","data":{"user_id":"u1","username":"ana","text":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(chat, Some(StreamFrame::Chat(ref p)) if p.text == "hi"));

        assert_eq!(StreamFrame::parse(r#"{"type":"typing","data":{"x":1}}"#).unwrap(), None);
        assert!(StreamFrame::parse("not json").is_err());
    }

    #[test]
    fn outbound_chat_wire_shape() {
        let json = OutboundFrame::Chat { text: "hello".into() }.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"type": "chat", "text": "hello"}));
    }
}

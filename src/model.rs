//! Session data model: status, room session, members and chat messages.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::protocol::{RemoteMember, RoomId, UserId};

/// Default prefix for generated avatar references.
pub const DEFAULT_AVATAR_BASE_URL: &str = "https://api.dicebear.com/7.x/avataaars/svg?seed=";

// ── Status ──────────────────────────────────────────────────────────

/// Matchmaking/room status. Exactly one value at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Not queued and not in a room.
    #[default]
    Idle,
    /// Queued; waiting for the backend to form a team.
    Searching,
    /// In a room. A [`RoomSession`] exists exactly in this state.
    Matched,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Matched => "matched",
        })
    }
}

// ── Members ─────────────────────────────────────────────────────────

/// Role of a member within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Leader,
    #[default]
    Member,
}

/// Canonical member shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: UserId,
    pub display_name: String,
    pub handle: String,
    pub role: MemberRole,
    pub avatar_ref: String,
}

impl Member {
    /// Map one backend member record onto the canonical shape.
    ///
    /// Returns `None` for records that carry no id at all.
    pub fn from_remote(
        remote: &RemoteMember,
        leader_id: Option<&str>,
        avatar_base_url: &str,
    ) -> Option<Self> {
        let id = remote.member_id()?.to_string();
        let handle = remote.handle().unwrap_or("user").to_string();
        let display_name = remote
            .display_name()
            .or(remote.handle())
            .unwrap_or("User")
            .to_string();
        let avatar_ref = match remote.user.as_deref().and_then(|u| u.avatar.as_deref()) {
            Some(avatar) => avatar.to_string(),
            None => match remote.avatar.as_deref() {
                Some(avatar) => avatar.to_string(),
                None => format!("{avatar_base_url}{}", remote.handle().unwrap_or(&id)),
            },
        };
        let role = if leader_id == Some(id.as_str()) {
            MemberRole::Leader
        } else {
            MemberRole::Member
        };
        Some(Self {
            id,
            display_name,
            handle,
            role,
            avatar_ref,
        })
    }
}

/// Normalize a list of backend member records, keeping arrival order and
/// dropping duplicate ids (first occurrence wins).
pub fn normalize_members(
    remote: &[RemoteMember],
    leader_id: Option<&str>,
    avatar_base_url: &str,
) -> Vec<Member> {
    let mut members: Vec<Member> = Vec::with_capacity(remote.len());
    for record in remote {
        let Some(member) = Member::from_remote(record, leader_id, avatar_base_url) else {
            continue;
        };
        if !members.iter().any(|m| m.id == member.id) {
            members.push(member);
        }
    }
    members
}

// ── Room session ────────────────────────────────────────────────────

/// Lifecycle tag of a [`RoomSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomLifecycle {
    #[default]
    Active,
    Ended,
}

/// The durable unit: which room the user is in and who else is there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSession {
    pub room_id: RoomId,
    #[serde(default)]
    pub leader_id: Option<UserId>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub status: RoomLifecycle,
}

impl RoomSession {
    /// Create an active session with a provisional member list.
    pub fn new(
        room_id: impl Into<RoomId>,
        leader_id: Option<UserId>,
        members: Vec<Member>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            leader_id,
            members,
            status: RoomLifecycle::Active,
        }
    }

    /// Replace the member list with an authoritative snapshot.
    pub fn apply_snapshot(&mut self, members: Vec<Member>) {
        self.members = members;
        self.refresh_roles();
    }

    /// Set the leader, if one is now known, and update member roles.
    pub fn set_leader(&mut self, leader_id: Option<UserId>) {
        if leader_id.is_some() {
            self.leader_id = leader_id;
        }
        self.refresh_roles();
    }

    fn refresh_roles(&mut self) {
        for member in &mut self.members {
            member.role = if self.leader_id.as_deref() == Some(member.id.as_str()) {
                MemberRole::Leader
            } else {
                MemberRole::Member
            };
        }
    }

    /// Returns `true` if a member with `user_id` is in the list.
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.id == user_id)
    }

    /// The member designated as leader, if present in the list.
    pub fn leader(&self) -> Option<&Member> {
        let leader_id = self.leader_id.as_deref()?;
        self.members.iter().find(|m| m.id == leader_id)
    }

    /// Mark the session as ended and return it.
    #[must_use]
    pub fn ended(mut self) -> Self {
        self.status = RoomLifecycle::Ended;
        self
    }
}

// ── Chat ────────────────────────────────────────────────────────────

/// Who sent a [`ChatMessage`], relative to the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    #[serde(rename = "self")]
    Own,
    Peer,
}

/// One line of the in-memory, session-scoped chat log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Locally generated, increasing within a controller.
    pub id: u64,
    pub sender_id: UserId,
    pub sender_name: String,
    pub text: String,
    pub received_at: SystemTime,
    pub origin: MessageOrigin,
}

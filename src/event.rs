//! Notifications delivered by the [`SessionController`](crate::SessionController).

use crate::model::{ChatMessage, RoomSession, SessionStatus};
use crate::protocol::RoomId;

/// Something the consumer may want to react to.
///
/// Events are delivered on a bounded channel. If the consumer falls behind,
/// events are dropped with a warning; the authoritative state is always
/// available from [`SessionController::snapshot`](crate::SessionController::snapshot).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The status changed.
    StatusChanged(SessionStatus),
    /// The join request was accepted and the user is queued.
    SearchStarted,
    /// Searching stopped without a match.
    SearchCancelled,
    /// A fresh match: the room stream opened for the first time.
    TeamFormed(RoomSession),
    /// A persisted session was revalidated and adopted.
    Resumed(RoomSession),
    /// The member list changed.
    MembersUpdated(RoomSession),
    /// A chat line was appended to the log.
    MessageReceived(ChatMessage),
    /// The room stream is open.
    ChannelOpened { room_id: RoomId },
    /// The room stream closed. The session stays `Matched`.
    ChannelClosed { room_id: RoomId, reason: Option<String> },
    /// The user left the room.
    Left { room_id: RoomId },
    /// The credential was rejected; sign in again.
    AuthorizationRequired,
    /// A user-facing failure with a short readable reason.
    Error { message: String },
}

//! crates/campus_chat_core/src/domain.rs
//!
//! Defines the pure, core data structures for the chat subsystem.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Which side of the job board an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Student,
    Recruiter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Recruiter => "recruiter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "recruiter" | "employer" => Some(Role::Recruiter),
            _ => None,
        }
    }
}

/// The authenticated principal on whose behalf chat operations run.
/// The role comes from the session provider and is trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn student(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Student }
    }

    pub fn recruiter(user_id: Uuid) -> Self {
        Self { user_id, role: Role::Recruiter }
    }
}

/// A persistent conversation between one student and one recruiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRoom {
    pub id: Uuid,
    pub student_id: Uuid,
    pub recruiter_id: Uuid,
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.student_id == user_id || self.recruiter_id == user_id
    }

    /// The participant that is not `user_id`, if `user_id` is in the room at all.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        if self.student_id == user_id {
            Some(self.recruiter_id)
        } else if self.recruiter_id == user_id {
            Some(self.student_id)
        } else {
            None
        }
    }
}

/// The insertable part of a room; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatRoom {
    pub student_id: Uuid,
    pub recruiter_id: Uuid,
    pub job_id: Option<Uuid>,
}

/// A single message inside a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl ChatMessage {
    /// The one unread predicate used by every counting and marking path.
    pub fn is_unread_for(&self, viewer: Uuid) -> bool {
        !self.is_read && self.sender_id != viewer
    }

    /// Display order: send time, tie-broken by id.
    pub fn delivery_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender_id: Uuid, is_read: bool) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            sender_id,
            content: "hi".to_string(),
            created_at: Utc::now(),
            is_read,
        }
    }

    #[test]
    fn unread_excludes_own_and_read_messages() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(message(other, false).is_unread_for(me));
        assert!(!message(other, true).is_unread_for(me));
        assert!(!message(me, false).is_unread_for(me));
    }

    #[test]
    fn other_participant_resolves_both_sides() {
        let now = Utc::now();
        let room = ChatRoom {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            recruiter_id: Uuid::new_v4(),
            job_id: None,
            created_at: now,
            updated_at: now,
        };

        assert_eq!(room.other_participant(room.student_id), Some(room.recruiter_id));
        assert_eq!(room.other_participant(room.recruiter_id), Some(room.student_id));
        assert_eq!(room.other_participant(Uuid::new_v4()), None);
    }

    #[test]
    fn role_parse_accepts_employer_alias() {
        assert_eq!(Role::parse("Student"), Some(Role::Student));
        assert_eq!(Role::parse("employer"), Some(Role::Recruiter));
        assert_eq!(Role::parse("admin"), None);
    }
}

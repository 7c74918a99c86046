//! Conversation entity.

use std::collections::{HashMap, HashSet};

use chatwire_common::events::{
    BlockState, ConversationKind, ConversationPayload, ConversationSettingsPayload,
    LastMessagePayload, MuteEntry, ParticipantPayload, ParticipantRole,
};
use chrono::{DateTime, Utc};

/// A participant entry within a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,

    pub role: ParticipantRole,

    pub joined_at: DateTime<Utc>,

    /// Last time this user marked the conversation as read.
    pub last_seen_at: Option<DateTime<Utc>>,

    /// False once the user has left the conversation.
    pub is_active: bool,
}

impl Participant {
    /// A regular member joining now.
    #[must_use]
    pub fn member(user_id: &str, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            role: ParticipantRole::Member,
            joined_at,
            last_seen_at: None,
            is_active: true,
        }
    }

    /// The conversation owner joining now.
    #[must_use]
    pub fn owner(user_id: &str, joined_at: DateTime<Utc>) -> Self {
        Self {
            role: ParticipantRole::Owner,
            ..Self::member(user_id, joined_at)
        }
    }
}

/// Per-user conversation settings.
///
/// Stored as sets and maps for cheap mutation; sorted into deterministic
/// lists when converted to a wire payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    /// Users who archived the conversation.
    pub archived_by: HashSet<String>,

    /// Users who pinned the conversation.
    pub pinned_by: HashSet<String>,

    /// Muting users, each with an optional expiry.
    pub muted_by: HashMap<String, Option<DateTime<Utc>>>,

    /// Block state, if any participant blocked the conversation.
    pub block: Option<BlockState>,
}

/// A conversation aggregate root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Model {
    pub id: String,

    pub kind: ConversationKind,

    pub participants: Vec<Participant>,

    /// Denormalized preview of the most recent message.
    pub last_message: Option<LastMessagePayload>,

    /// Unread message count keyed by user ID.
    pub unread_counts: HashMap<String, u32>,

    pub settings: Settings,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Looks up a participant entry by user ID.
    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Mutable participant lookup.
    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Whether the user is currently an active participant.
    #[must_use]
    pub fn is_active_participant(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some_and(|p| p.is_active)
    }

    /// IDs of all active participants.
    #[must_use]
    pub fn active_participant_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Whether this is the direct conversation between exactly these two users.
    #[must_use]
    pub fn is_direct_between(&self, a: &str, b: &str) -> bool {
        self.kind == ConversationKind::Direct
            && self.participants.len() == 2
            && self.participant(a).is_some()
            && self.participant(b).is_some()
    }

    /// Unread message count for one user.
    #[must_use]
    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }

    /// Whether the user has the conversation muted at the given instant.
    ///
    /// A mute without an expiry holds until explicitly cleared.
    #[must_use]
    pub fn is_muted_by(&self, user_id: &str, at: DateTime<Utc>) -> bool {
        match self.settings.muted_by.get(user_id) {
            Some(None) => true,
            Some(Some(until)) => *until > at,
            None => false,
        }
    }

    /// Converts to the wire payload shape.
    ///
    /// Settings sets are sorted so repeated conversions of the same state
    /// produce identical output.
    #[must_use]
    pub fn to_payload(&self) -> ConversationPayload {
        let mut archived_by: Vec<String> = self.settings.archived_by.iter().cloned().collect();
        archived_by.sort();

        let mut pinned_by: Vec<String> = self.settings.pinned_by.iter().cloned().collect();
        pinned_by.sort();

        let mut muted_by: Vec<MuteEntry> = self
            .settings
            .muted_by
            .iter()
            .map(|(user_id, until)| MuteEntry {
                user_id: user_id.clone(),
                until: *until,
            })
            .collect();
        muted_by.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        ConversationPayload {
            id: self.id.clone(),
            kind: self.kind,
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantPayload {
                    user_id: p.user_id.clone(),
                    role: p.role,
                    joined_at: p.joined_at,
                    last_seen_at: p.last_seen_at,
                    is_active: p.is_active,
                })
                .collect(),
            last_message: self.last_message.clone(),
            unread_counts: self.unread_counts.clone(),
            settings: ConversationSettingsPayload {
                archived_by,
                pinned_by,
                muted_by,
                block: self.settings.block.clone(),
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

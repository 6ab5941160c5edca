use crate::domain::{CardId, CardStatus, EntryId, UserId};

/// Something that has been durably committed and may invalidate a user's rollup.
///
/// Events are emitted after commit only; handling them can never undo or
/// fail the operation that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitEvent {
    CardIssued {
        user_id: UserId,
        card_id: CardId,
    },
    EntryRecorded {
        user_id: UserId,
        card_id: CardId,
        entry_id: EntryId,
    },
    StatusChanged {
        user_id: UserId,
        card_id: CardId,
        status: CardStatus,
    },
}

impl CommitEvent {
    pub fn user_id(&self) -> &UserId {
        match self {
            CommitEvent::CardIssued { user_id, .. }
            | CommitEvent::EntryRecorded { user_id, .. }
            | CommitEvent::StatusChanged { user_id, .. } => user_id,
        }
    }

    pub fn card_id(&self) -> CardId {
        match self {
            CommitEvent::CardIssued { card_id, .. }
            | CommitEvent::EntryRecorded { card_id, .. }
            | CommitEvent::StatusChanged { card_id, .. } => *card_id,
        }
    }
}

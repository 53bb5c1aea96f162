use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Created,
    Edited,
    Cancelled,
    OccurrenceCancelled,
}

/// Sent to a reservation's organizer after every successful mutation.
/// Carries what a chat layer needs to offer edit/cancel actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationNotice {
    pub kind: NoticeKind,
    pub group_id: GroupId,
    pub room: RoomId,
    pub title: String,
    pub organizer: String,
    pub status: GroupStatus,
    /// Active occurrences after the mutation.
    pub occurrences: Vec<NoticeOccurrence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoticeOccurrence {
    pub record_id: RecordId,
    pub start: Ts,
    pub end: Ts,
}

impl MutationNotice {
    pub fn for_group(kind: NoticeKind, group: &ReservationGroup) -> Self {
        Self {
            kind,
            group_id: group.id,
            room: group.room.clone(),
            title: group.title.clone(),
            organizer: group.organizer.clone(),
            status: group.status,
            occurrences: group
                .active()
                .map(|o| NoticeOccurrence {
                    record_id: o.record_id.clone(),
                    start: o.span().start,
                    end: o.span().end,
                })
                .collect(),
        }
    }
}

/// Broadcast hub for mutation notices per organizer.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<MutationNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for an organizer. Creates the channel if needed.
    pub fn subscribe(&self, organizer: &str) -> broadcast::Receiver<MutationNotice> {
        let sender = self
            .channels
            .entry(organizer.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice to its organizer. No-op if nobody is listening.
    pub fn send(&self, notice: &MutationNotice) {
        let Some(sender) = self.channels.get(&notice.organizer) else {
            return;
        };
        if sender.send(notice.clone()).is_err() {
            // Every receiver is gone.
            drop(sender);
            self.channels
                .remove_if(&notice.organizer, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// UTC instant. The only time type the engine reasons about.
pub type Ts = DateTime<Utc>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ts, end: Ts) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ts) -> bool {
        self.start <= t && t < self.end
    }

    /// Smallest span covering every input, or `None` for an empty input.
    pub fn cover<'a>(spans: impl IntoIterator<Item = &'a Span>) -> Option<Span> {
        spans.into_iter().fold(None, |acc: Option<Span>, s| {
            Some(match acc {
                None => *s,
                Some(c) => Span {
                    start: c.start.min(s.start),
                    end: c.end.max(s.end),
                },
            })
        })
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// ── Identifiers ──────────────────────────────────────────────────

/// Configured room identifier (e.g. `room_1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the record store assigned to one persisted occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical handle shared by every record produced from one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub Ulid);

impl GroupId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GroupId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

// ── Reference data ───────────────────────────────────────────────

/// A bookable room. Owned by configuration, never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub capacity: Option<u32>,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    Active,
    Cancelled,
}

impl OccurrenceStatus {
    /// Label used by stores that persist the status as text.
    pub fn label(&self) -> &'static str {
        match self {
            OccurrenceStatus::Active => "Active",
            OccurrenceStatus::Cancelled => "Cancelled",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Active" => Some(OccurrenceStatus::Active),
            "Cancelled" => Some(OccurrenceStatus::Cancelled),
            _ => None,
        }
    }
}

/// How a single request expands into occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    #[default]
    None,
    /// `count` occurrences, each one week after the previous.
    Weekly { count: u32 },
}

impl Recurrence {
    pub fn occurrence_count(&self) -> u32 {
        match self {
            Recurrence::None => 1,
            Recurrence::Weekly { count } => *count,
        }
    }
}

/// Everything persisted for one occurrence, minus the store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub group_id: GroupId,
    pub room: RoomId,
    pub span: Span,
    pub title: String,
    pub organizer: String,
    pub attendees: Vec<String>,
    pub team: Option<String>,
    pub status: OccurrenceStatus,
    pub recurrence: Recurrence,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == OccurrenceStatus::Active
    }

    pub fn with_status(&self, status: OccurrenceStatus) -> Booking {
        Booking {
            status,
            ..self.clone()
        }
    }
}

/// A committed occurrence as read back from the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOccurrence {
    pub record_id: RecordId,
    #[serde(flatten)]
    pub booking: Booking,
}

impl ReservationOccurrence {
    pub fn span(&self) -> &Span {
        &self.booking.span
    }

    pub fn is_active(&self) -> bool {
        self.booking.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    PartiallyCancelled,
    Cancelled,
}

/// All occurrences created by one request, reassembled from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationGroup {
    pub id: GroupId,
    pub room: RoomId,
    pub title: String,
    pub organizer: String,
    pub recurrence: Recurrence,
    pub status: GroupStatus,
    /// Ordered by start time, then record id.
    pub occurrences: Vec<ReservationOccurrence>,
}

impl ReservationGroup {
    /// Rebuild a group from its member records. `None` when there are none.
    pub fn from_records(id: GroupId, mut records: Vec<ReservationOccurrence>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        records.sort_by(|a, b| {
            a.span()
                .start
                .cmp(&b.span().start)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });

        let active = records.iter().filter(|r| r.is_active()).count();
        let status = if active == records.len() {
            GroupStatus::Active
        } else if active == 0 {
            GroupStatus::Cancelled
        } else {
            GroupStatus::PartiallyCancelled
        };

        let head = records
            .iter()
            .find(|r| r.is_active())
            .unwrap_or(&records[0])
            .booking
            .clone();

        Some(Self {
            id,
            room: head.room,
            title: head.title,
            organizer: head.organizer,
            recurrence: head.recurrence,
            status,
            occurrences: records,
        })
    }

    pub fn record_ids(&self) -> Vec<RecordId> {
        self.occurrences.iter().map(|o| o.record_id.clone()).collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &ReservationOccurrence> {
        self.occurrences.iter().filter(|o| o.is_active())
    }

    pub fn active_record_ids(&self) -> HashSet<RecordId> {
        self.active().map(|o| o.record_id.clone()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn span_basics() {
        let s = span(10, 0, 11, 0);
        assert_eq!(s.duration(), TimeDelta::hours(1));
        assert!(s.contains_instant(at(10, 0)));
        assert!(s.contains_instant(at(10, 59)));
        assert!(!s.contains_instant(at(11, 0))); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = span(10, 0, 11, 0);
        let b = span(10, 30, 11, 30);
        let c = span(11, 0, 12, 0);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn overlap_is_symmetric() {
        let spans = [
            span(9, 0, 10, 0),
            span(9, 30, 10, 30),
            span(10, 0, 11, 0),
            span(8, 0, 12, 0),
            span(10, 59, 11, 1),
        ];
        for a in &spans {
            assert!(a.overlaps(a), "{a} must overlap itself");
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(at(10, 0), at(10, 0)).is_none());
        assert!(Span::try_new(at(11, 0), at(10, 0)).is_none());
        assert!(Span::try_new(at(10, 0), at(10, 1)).is_some());
    }

    #[test]
    fn cover_spans_all_inputs() {
        let spans = [span(13, 0, 14, 0), span(9, 0, 10, 0), span(11, 0, 15, 0)];
        assert_eq!(Span::cover(&spans), Some(span(9, 0, 15, 0)));
        assert_eq!(Span::cover(&Vec::<Span>::new()), None);
    }

    #[test]
    fn group_status_is_derived_from_members() {
        let gid = GroupId::new();
        let mut a = occurrence("a", "r1", span(9, 0, 10, 0));
        let mut b = occurrence("b", "r1", span(11, 0, 12, 0));
        a.booking.group_id = gid;
        b.booking.group_id = gid;

        let g = ReservationGroup::from_records(gid, vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(g.status, GroupStatus::Active);

        b.booking.status = OccurrenceStatus::Cancelled;
        let g = ReservationGroup::from_records(gid, vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(g.status, GroupStatus::PartiallyCancelled);
        assert_eq!(g.active_record_ids().len(), 1);

        a.booking.status = OccurrenceStatus::Cancelled;
        let g = ReservationGroup::from_records(gid, vec![a, b]).unwrap();
        assert_eq!(g.status, GroupStatus::Cancelled);
        assert_eq!(g.active().count(), 0);
    }

    #[test]
    fn group_members_sorted_by_start() {
        let gid = GroupId::new();
        let late = occurrence("z", "r1", span(15, 0, 16, 0));
        let early = occurrence("y", "r1", span(8, 0, 9, 0));
        let g = ReservationGroup::from_records(gid, vec![late, early]).unwrap();
        assert_eq!(g.record_ids(), vec![RecordId::new("y"), RecordId::new("z")]);
    }

    #[test]
    fn empty_group_is_none() {
        assert!(ReservationGroup::from_records(GroupId::new(), vec![]).is_none());
    }

    #[test]
    fn status_labels_roundtrip() {
        for s in [OccurrenceStatus::Active, OccurrenceStatus::Cancelled] {
            assert_eq!(OccurrenceStatus::from_label(s.label()), Some(s));
        }
        assert_eq!(OccurrenceStatus::from_label("archived"), None);
    }

    #[test]
    fn recurrence_wire_shape() {
        let weekly: Recurrence = serde_json::from_str(r#"{"weekly":{"count":4}}"#).unwrap();
        assert_eq!(weekly, Recurrence::Weekly { count: 4 });
        let none: Recurrence = serde_json::from_str(r#""none""#).unwrap();
        assert_eq!(none.occurrence_count(), 1);
    }
}

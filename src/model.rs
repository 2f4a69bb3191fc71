use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Fallible constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Lifecycle ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    Overdue,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Pending,
        Status::Confirmed,
        Status::Active,
        Status::Completed,
        Status::Cancelled,
        Status::Overdue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Confirmed => "confirmed",
            Status::Active => "active",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Overdue => "overdue",
        }
    }

    /// No outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }

    /// Whether a reservation in this status still holds its unit.
    /// Overdue equipment has not come back yet, so it keeps blocking.
    pub fn occupies(self) -> bool {
        !self.is_terminal()
    }

    pub fn allowed_targets(self) -> &'static [Status] {
        match self {
            Status::Pending => &[Status::Confirmed, Status::Cancelled],
            Status::Confirmed => &[Status::Active, Status::Cancelled, Status::Overdue],
            Status::Active => &[Status::Completed, Status::Cancelled, Status::Overdue],
            Status::Overdue => &[Status::Completed, Status::Cancelled],
            Status::Completed | Status::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: Status) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// Statuses in which the owner may attach a review.
    pub fn is_reviewable(self) -> bool {
        matches!(self, Status::Confirmed | Status::Active | Status::Completed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| EngineError::InvalidStatus(s.to_string()))
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "user")]
    Customer,
    Admin,
}

/// The authenticated caller, as supplied by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn customer(id: Ulid) -> Self {
        Self { id, role: Role::Customer }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    /// Identity used by background jobs (overdue sweep).
    pub fn system() -> Self {
        Self::admin(Ulid::nil())
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub status: Status,
    pub changed_by: Ulid,
    pub reason: Option<String>,
    pub changed_at: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notes {
    #[serde(default)]
    pub customer_notes: Option<String>,
    #[serde(default)]
    pub admin_notes: Option<String>,
    #[serde(default)]
    pub damage_report: Option<String>,
}

impl Notes {
    /// Overwrite the fields present in `patch`; an empty string clears a field.
    pub fn apply(&mut self, patch: &NotesPatch) {
        fn set(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                let trimmed = v.trim();
                *slot = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                };
            }
        }
        set(&mut self.customer_notes, &patch.customer_notes);
        set(&mut self.admin_notes, &patch.admin_notes);
        set(&mut self.damage_report, &patch.damage_report);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub equipment_id: Ulid,
    /// Physical unit index in `0..quantity`.
    pub unit: u32,
    pub span: Span,
    pub actual_start: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub status: Status,
    pub history: Vec<HistoryEntry>,
    pub notes: Notes,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn is_owned_by(&self, actor: &Actor) -> bool {
        self.user_id == actor.id
    }
}

/// Input for a new reservation. `user_id` defaults to the caller; only admins
/// may book on behalf of someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservationDraft {
    pub equipment_id: Ulid,
    pub span: Span,
    #[serde(default)]
    pub user_id: Option<Ulid>,
    #[serde(default)]
    pub notes: Notes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotesPatch {
    #[serde(default)]
    pub customer_notes: Option<String>,
    #[serde(default)]
    pub admin_notes: Option<String>,
    #[serde(default)]
    pub damage_report: Option<String>,
}

/// The only fields a reservation edit may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservationPatch {
    #[serde(default)]
    pub span: Option<Span>,
    #[serde(default)]
    pub notes: Option<NotesPatch>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.span.is_none() && self.notes.is_none()
    }
}

// ── Reviews ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub equipment_id: Ulid,
    pub user_id: Ulid,
    pub rating: u8,
    pub title: Option<String>,
    pub comment: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewDraft {
    pub reservation_id: Ulid,
    pub rating: u8,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewPatch {
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

// ── Per-equipment state ──────────────────────────────────────────

/// Every reservation ever made against one equipment id, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub id: Ulid,
    pub reservations: Vec<Reservation>,
}

impl EquipmentState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps the query window, in any status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Every state change, as written to the WAL and broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        equipment_id: Ulid,
        span: Span,
        unit: u32,
        notes: Notes,
        updated_at: Ms,
    },
    StatusChanged {
        id: Ulid,
        equipment_id: Ulid,
        from: Status,
        to: Status,
        changed_by: Ulid,
        reason: Option<String>,
        changed_at: Ms,
    },
    ReservationDeleted {
        id: Ulid,
        equipment_id: Ulid,
    },
    ReviewCreated {
        review: Review,
    },
    ReviewUpdated {
        id: Ulid,
        reservation_id: Ulid,
        equipment_id: Ulid,
        rating: u8,
        title: Option<String>,
        comment: Option<String>,
        updated_at: Ms,
    },
    ReviewDeleted {
        id: Ulid,
        reservation_id: Ulid,
        equipment_id: Ulid,
    },
}

impl Event {
    pub fn equipment_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { reservation } => reservation.equipment_id,
            Event::ReviewCreated { review } => review.equipment_id,
            Event::ReservationUpdated { equipment_id, .. }
            | Event::StatusChanged { equipment_id, .. }
            | Event::ReservationDeleted { equipment_id, .. }
            | Event::ReviewUpdated { equipment_id, .. }
            | Event::ReviewDeleted { equipment_id, .. } => *equipment_id,
        }
    }

    /// Notification name delivered to listeners.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ReservationCreated { .. } => "reservation.created",
            Event::ReservationUpdated { .. } => "reservation.updated",
            Event::StatusChanged { .. } => "reservation.statusChanged",
            Event::ReservationDeleted { .. } => "reservation.deleted",
            Event::ReviewCreated { .. } => "review.created",
            Event::ReviewUpdated { .. } => "review.updated",
            Event::ReviewDeleted { .. } => "review.deleted",
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReservationFilter {
    #[serde(default)]
    pub user_id: Option<Ulid>,
    #[serde(default)]
    pub equipment_id: Option<Ulid>,
    #[serde(default)]
    pub status: Option<Status>,
    /// Keep reservations ending at or after this instant.
    #[serde(default)]
    pub from: Option<Ms>,
    /// Keep reservations starting at or before this instant.
    #[serde(default)]
    pub to: Option<Ms>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewFilter {
    #[serde(default)]
    pub reservation_id: Option<Ulid>,
    #[serde(default)]
    pub equipment_id: Option<Ulid>,
    #[serde(default)]
    pub user_id: Option<Ulid>,
    /// Comma-separated keys, `-` for descending: `"rating,-createdAt"`.
    /// Defaults to newest first.
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingSummary {
    pub equipment_id: Ulid,
    pub average: f64,
    pub count: usize,
}

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedEquipmentState = Arc<RwLock<EquipmentState>>;

/// In-memory reservation store: per-equipment reservation sets plus lookup indices.
///
/// All reservation and review mutations for one equipment id happen while the caller
/// holds that equipment's write lock; the indices are only ever touched from
/// [`InMemoryStore::apply_event`] under the same lock.
pub struct InMemoryStore {
    equipment: DashMap<Ulid, SharedEquipmentState>,
    /// reservation id → equipment id
    reservation_index: DashMap<Ulid, Ulid>,
    /// reservation id → its review (at most one)
    reviews: DashMap<Ulid, Review>,
    /// review id → reservation id
    review_index: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            equipment: DashMap::new(),
            reservation_index: DashMap::new(),
            reviews: DashMap::new(),
            review_index: DashMap::new(),
        }
    }

    // ── Equipment ────────────────────────────────────────────

    pub fn get_equipment(&self, id: &Ulid) -> Option<SharedEquipmentState> {
        self.equipment.get(id).map(|e| e.value().clone())
    }

    /// Equipment state is created lazily on first reservation.
    pub fn equipment_or_insert(&self, id: Ulid) -> SharedEquipmentState {
        self.equipment
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(EquipmentState::new(id))))
            .value()
            .clone()
    }

    /// Publish a fully built state (WAL replay).
    pub fn insert_equipment(&self, es: EquipmentState) {
        self.equipment.insert(es.id, Arc::new(RwLock::new(es)));
    }

    pub fn equipment_ids(&self) -> Vec<Ulid> {
        self.equipment.iter().map(|e| *e.key()).collect()
    }

    pub fn equipment_count(&self) -> usize {
        self.equipment.len()
    }

    // ── Reservation index ────────────────────────────────────

    pub fn equipment_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_index.len()
    }

    // ── Reviews ──────────────────────────────────────────────

    pub fn review_for_reservation(&self, reservation_id: &Ulid) -> Option<Review> {
        self.reviews.get(reservation_id).map(|e| e.value().clone())
    }

    pub fn has_review(&self, reservation_id: &Ulid) -> bool {
        self.reviews.contains_key(reservation_id)
    }

    pub fn reservation_for_review(&self, review_id: &Ulid) -> Option<Ulid> {
        self.review_index.get(review_id).map(|e| *e.value())
    }

    pub fn reviews_snapshot(&self) -> Vec<Review> {
        self.reviews.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to its equipment state (caller holds the write lock).
    pub fn apply_event(&self, es: &mut EquipmentState, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.reservation_index
                    .insert(reservation.id, reservation.equipment_id);
                es.insert_reservation(reservation.clone());
            }
            Event::ReservationUpdated {
                id,
                span,
                unit,
                notes,
                updated_at,
                ..
            } => {
                // Re-insert so the start-sorted order survives a span change.
                if let Some(mut r) = es.remove_reservation(*id) {
                    r.span = *span;
                    r.unit = *unit;
                    r.notes = notes.clone();
                    r.updated_at = *updated_at;
                    es.insert_reservation(r);
                }
            }
            Event::StatusChanged {
                id,
                to,
                changed_by,
                reason,
                changed_at,
                ..
            } => {
                if let Some(r) = es.get_mut(*id) {
                    super::lifecycle::apply_transition(r, *to, *changed_by, reason.clone(), *changed_at);
                }
            }
            Event::ReservationDeleted { id, .. } => {
                es.remove_reservation(*id);
                self.reservation_index.remove(id);
            }
            Event::ReviewCreated { review } => {
                self.review_index.insert(review.id, review.reservation_id);
                self.reviews.insert(review.reservation_id, review.clone());
            }
            Event::ReviewUpdated {
                reservation_id,
                rating,
                title,
                comment,
                updated_at,
                ..
            } => {
                if let Some(mut review) = self.reviews.get_mut(reservation_id) {
                    review.rating = *rating;
                    review.title = title.clone();
                    review.comment = comment.clone();
                    review.updated_at = *updated_at;
                }
            }
            Event::ReviewDeleted { id, reservation_id, .. } => {
                self.reviews.remove(reservation_id);
                self.review_index.remove(id);
            }
        }
    }
}

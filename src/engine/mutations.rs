use ulid::Ulid;

use crate::catalog::EquipmentInfo;
use crate::limits::*;
use crate::model::*;
use crate::observability::{CONFLICTS_TOTAL, RESERVATIONS_CREATED_TOTAL};
use crate::policy::{self, Action};

use super::conflict::{free_unit, now_ms, validate_span};
use super::{Engine, EngineError, WalControl};

fn check_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.trim().chars().count() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_notes(
    customer_notes: &Option<String>,
    admin_notes: &Option<String>,
    damage_report: &Option<String>,
) -> Result<(), EngineError> {
    check_len(customer_notes, MAX_CUSTOMER_NOTES_LEN, "customer notes too long")?;
    check_len(admin_notes, MAX_ADMIN_NOTES_LEN, "admin notes too long")?;
    check_len(damage_report, MAX_DAMAGE_REPORT_LEN, "damage report too long")
}

fn reservable(info: Option<EquipmentInfo>, equipment_id: Ulid) -> Result<u32, EngineError> {
    info.filter(EquipmentInfo::is_reservable)
        .map(|e| e.quantity.min(MAX_UNITS_PER_EQUIPMENT))
        .ok_or(EngineError::EquipmentUnavailable(equipment_id))
}

/// Reservations still holding a unit. Completed and cancelled records stay in
/// the state for history but do not count toward the per-equipment cap.
fn live_reservations(es: &EquipmentState) -> usize {
    es.reservations.iter().filter(|r| r.status.occupies()).count()
}

fn count_conflict(result: Result<u32, EngineError>) -> Result<u32, EngineError> {
    if let Err(EngineError::Conflict(_)) = &result {
        metrics::counter!(CONFLICTS_TOTAL).increment(1);
    }
    result
}

impl Engine {
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        draft: ReservationDraft,
    ) -> Result<Reservation, EngineError> {
        validate_span(&draft.span)?;
        let notes = &draft.notes;
        validate_notes(&notes.customer_notes, &notes.admin_notes, &notes.damage_report)?;
        let user_id = match draft.user_id {
            Some(uid) if uid != actor.id && !actor.is_admin() => {
                return Err(EngineError::Forbidden);
            }
            Some(uid) => uid,
            None => actor.id,
        };
        let equipment_id = draft.equipment_id;
        let quantity = reservable(self.catalog.lookup(equipment_id).await, equipment_id)?;

        let _commit = self.commit_gate.read().await;
        let shared = self.store.equipment_or_insert(equipment_id);
        let mut guard = shared.write().await;
        if live_reservations(&guard) >= MAX_RESERVATIONS_PER_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too many reservations on equipment"));
        }
        let unit = count_conflict(free_unit(&guard, &draft.span, quantity, None, None))?;

        let now = now_ms();
        let mut stored_notes = Notes::default();
        stored_notes.apply(&NotesPatch {
            customer_notes: draft.notes.customer_notes,
            admin_notes: draft.notes.admin_notes,
            damage_report: draft.notes.damage_report,
        });
        let reservation = Reservation {
            id: Ulid::new(),
            user_id,
            equipment_id,
            unit,
            span: draft.span,
            actual_start: None,
            actual_end: None,
            status: Status::Pending,
            history: vec![HistoryEntry {
                status: Status::Pending,
                changed_by: actor.id,
                reason: Some("created".into()),
                changed_at: now,
            }],
            notes: stored_notes,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(id = %reservation.id, %equipment_id, unit, "reservation created");
        Ok(reservation)
    }

    /// Change the interval and/or notes. A new interval is re-checked against
    /// everything else on the equipment, excluding this reservation itself.
    pub async fn update_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        if let Some(span) = &patch.span {
            validate_span(span)?;
        }
        if let Some(n) = &patch.notes {
            validate_notes(&n.customer_notes, &n.admin_notes, &n.damage_report)?;
        }
        // Looked up before taking the equipment lock; only used if the span moves.
        let catalog_info = match (&patch.span, self.store.equipment_for_reservation(&id)) {
            (Some(_), Some(equipment_id)) => self.catalog.lookup(equipment_id).await,
            _ => None,
        };

        let _commit = self.commit_gate.read().await;
        let (equipment_id, mut guard) = self.lock_reservation(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if current.status.is_terminal() && actor.is_admin() {
            return Err(EngineError::Finalized {
                id,
                status: current.status,
            });
        }
        policy::authorize(actor, current, Action::EditFields)?;
        if patch.is_empty() {
            return Ok(current.clone());
        }

        let (span, unit) = match patch.span {
            Some(span) if span != current.span => {
                let quantity = reservable(catalog_info, equipment_id)?;
                let unit = count_conflict(free_unit(
                    &guard,
                    &span,
                    quantity,
                    Some(id),
                    Some(current.unit),
                ))?;
                (span, unit)
            }
            _ => (current.span, current.unit),
        };
        let mut notes = current.notes.clone();
        if let Some(n) = &patch.notes {
            notes.apply(n);
        }

        let event = Event::ReservationUpdated {
            id,
            equipment_id,
            span,
            unit,
            notes,
            updated_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Hard delete. Refused while a review still references the reservation.
    pub async fn delete_reservation(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let (equipment_id, mut guard) = self.lock_reservation(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        policy::authorize(actor, current, Action::Delete)?;
        if self.store.has_review(&id) {
            return Err(EngineError::HasReview(id));
        }

        let event = Event::ReservationDeleted { id, equipment_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Rewrite the WAL as one creation event per live record.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive: no mutation is between its WAL append and its apply, and none
        // can start until the new file is in place.
        let _commit = self.commit_gate.write().await;

        let mut events = Vec::new();
        for equipment_id in self.store.equipment_ids() {
            let Some(shared) = self.store.get_equipment(&equipment_id) else {
                continue;
            };
            let guard = shared.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        events.extend(
            self.store
                .reviews_snapshot()
                .into_iter()
                .map(|review| Event::ReviewCreated { review }),
        );

        let records = events.len();
        self.wal_control(|response| WalControl::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(records, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal_control(|response| WalControl::AppendsSinceCompact { response })
            .await
    }
}

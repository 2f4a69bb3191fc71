use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::TRANSITIONS_TOTAL;
use crate::policy::{self, transition_action};

use super::conflict::now_ms;
use super::{Engine, EngineError};

pub fn check_transition(from: Status, to: Status) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition { from, to })
    }
}

/// Move `r` to `to` and record it. `actual_start` / `actual_end` are stamped on
/// the first entry into `active` / `completed` and never overwritten.
pub fn apply_transition(
    r: &mut Reservation,
    to: Status,
    changed_by: Ulid,
    reason: Option<String>,
    at: Ms,
) {
    match to {
        Status::Active if r.actual_start.is_none() => r.actual_start = Some(at),
        Status::Completed if r.actual_end.is_none() => r.actual_end = Some(at),
        _ => {}
    }
    r.status = to;
    r.history.push(HistoryEntry {
        status: to,
        changed_by,
        reason,
        changed_at: at,
    });
    r.updated_at = at;
}

pub(super) fn normalize_reason(reason: Option<String>) -> Result<Option<String>, EngineError> {
    let Some(reason) = reason else {
        return Ok(None);
    };
    let trimmed = reason.trim();
    if trimmed.chars().count() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

impl Engine {
    /// Drive a reservation through the lifecycle table on behalf of `actor`.
    pub async fn transition(
        &self,
        id: Ulid,
        actor: &Actor,
        to: Status,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let reason = normalize_reason(reason)?;
        let _commit = self.commit_gate.read().await;
        let (equipment_id, mut guard) = self.lock_reservation(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        policy::authorize(actor, current, transition_action(to))?;
        let from = current.status;
        check_transition(from, to)?;

        let event = Event::StatusChanged {
            id,
            equipment_id,
            from,
            to,
            changed_by: actor.id,
            reason,
            changed_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(TRANSITIONS_TOTAL, "from" => from.as_str(), "to" => to.as_str())
            .increment(1);
        tracing::info!(%id, %from, %to, actor = %actor.id, "status changed");

        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Textual entry point: an unknown status name fails before any lookup.
    pub async fn transition_named(
        &self,
        id: Ulid,
        actor: &Actor,
        to: &str,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let to: Status = to.parse()?;
        self.transition(id, actor, to, reason).await
    }

    /// Reservations whose span has ended while still confirmed or active.
    /// Skips equipment currently being written; the next sweep picks it up.
    pub fn collect_overdue(&self, now: Ms) -> Vec<Ulid> {
        let mut overdue = Vec::new();
        for equipment_id in self.store.equipment_ids() {
            let Some(shared) = self.store.get_equipment(&equipment_id) else {
                continue;
            };
            let Ok(guard) = shared.try_read() else {
                continue;
            };
            overdue.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| {
                        matches!(r.status, Status::Confirmed | Status::Active) && r.span.end <= now
                    })
                    .map(|r| r.id),
            );
        }
        overdue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            equipment_id: Ulid::new(),
            unit: 0,
            span: Span::new(0, 100),
            actual_start: None,
            actual_end: None,
            status: Status::Pending,
            history: Vec::new(),
            notes: Notes::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn check_transition_follows_table() {
        assert!(check_transition(Status::Pending, Status::Confirmed).is_ok());
        assert!(matches!(
            check_transition(Status::Pending, Status::Completed),
            Err(EngineError::IllegalTransition {
                from: Status::Pending,
                to: Status::Completed
            })
        ));
        for terminal in [Status::Completed, Status::Cancelled] {
            for to in Status::ALL {
                assert!(check_transition(terminal, to).is_err());
            }
        }
    }

    #[test]
    fn actual_times_are_stamped_once() {
        let mut r = pending();
        let by = Ulid::new();
        apply_transition(&mut r, Status::Confirmed, by, None, 10);
        assert_eq!(r.actual_start, None);

        apply_transition(&mut r, Status::Active, by, None, 20);
        apply_transition(&mut r, Status::Overdue, by, Some("late".into()), 30);
        apply_transition(&mut r, Status::Active, by, None, 40);
        assert_eq!(r.actual_start, Some(20));

        apply_transition(&mut r, Status::Completed, by, None, 50);
        assert_eq!(r.actual_end, Some(50));
        assert_eq!(r.updated_at, 50);
        assert_eq!(r.history.len(), 5);
        assert_eq!(r.history[2].reason.as_deref(), Some("late"));
        assert_eq!(r.history.last().map(|h| h.status), Some(Status::Completed));
    }

    #[test]
    fn reasons_are_trimmed_and_bounded() {
        assert_eq!(normalize_reason(None).unwrap(), None);
        assert_eq!(normalize_reason(Some("   ".into())).unwrap(), None);
        assert_eq!(
            normalize_reason(Some("  broken strap ".into())).unwrap().as_deref(),
            Some("broken strap")
        );
        assert!(matches!(
            normalize_reason(Some("x".repeat(MAX_REASON_LEN + 1))),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn reason_limit_counts_characters() {
        let polish = "ż".repeat(MAX_REASON_LEN);
        assert_eq!(normalize_reason(Some(polish.clone())).unwrap(), Some(polish));
        assert!(matches!(
            normalize_reason(Some("ż".repeat(MAX_REASON_LEN + 1))),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}

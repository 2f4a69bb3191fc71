use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if !span.is_valid() {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Reservations still holding a unit during `span`, minus `exclude`.
fn occupying<'a>(
    es: &'a EquipmentState,
    span: &'a Span,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Reservation> + 'a {
    es.overlapping(span)
        .filter(move |r| r.status.occupies() && Some(r.id) != exclude)
}

/// Equipment-level check: does anything occupying overlap `span`?
pub fn has_conflict(es: &EquipmentState, span: &Span, exclude: Option<Ulid>) -> bool {
    occupying(es, span, exclude).next().is_some()
}

/// Every occupying reservation overlapping `span`, for diagnostics.
pub fn conflicting_reservations(es: &EquipmentState, span: &Span, exclude: Option<Ulid>) -> Vec<Ulid> {
    occupying(es, span, exclude).map(|r| r.id).collect()
}

/// Pick a unit in `0..quantity` that is free for the whole of `span`.
///
/// `preferred` is kept when still free so an edit does not hop units needlessly;
/// otherwise the lowest free unit wins. With `quantity == 1` this is exactly the
/// plain overlap test.
pub fn free_unit(
    es: &EquipmentState,
    span: &Span,
    quantity: u32,
    exclude: Option<Ulid>,
    preferred: Option<u32>,
) -> Result<u32, EngineError> {
    if quantity == 0 {
        return Err(EngineError::EquipmentUnavailable(es.id));
    }
    let mut busy = HashSet::new();
    let mut first_conflict = None;
    for r in occupying(es, span, exclude) {
        busy.insert(r.unit);
        first_conflict.get_or_insert(r.id);
    }

    if let Some(unit) = preferred
        && unit < quantity
        && !busy.contains(&unit)
    {
        return Ok(unit);
    }
    (0..quantity)
        .find(|u| !busy.contains(u))
        .ok_or(EngineError::Conflict(first_conflict.unwrap_or(es.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Ms = 86_400_000;
    /// 2024-01-01T00:00:00Z
    const JAN_1: Ms = 1_704_067_200_000;

    fn jan(day: i64) -> Ms {
        JAN_1 + (day - 1) * DAY
    }

    fn held(es: &mut EquipmentState, start: Ms, end: Ms, unit: u32, status: Status) -> Ulid {
        let id = Ulid::new();
        es.insert_reservation(Reservation {
            id,
            user_id: Ulid::new(),
            equipment_id: es.id,
            unit,
            span: Span::new(start, end),
            actual_start: None,
            actual_end: None,
            status,
            history: Vec::new(),
            notes: Notes::default(),
            created_at: 0,
            updated_at: 0,
        });
        id
    }

    #[test]
    fn back_to_back_is_not_a_conflict() {
        let mut es = EquipmentState::new(Ulid::new());
        let existing = held(&mut es, jan(1), jan(5), 0, Status::Pending);

        assert!(!has_conflict(&es, &Span::new(jan(5), jan(8)), None));
        assert!(has_conflict(&es, &Span::new(jan(4), jan(6)), None));
        assert_eq!(
            conflicting_reservations(&es, &Span::new(jan(4), jan(6)), None),
            vec![existing]
        );
        // Ends exactly where the existing one starts
        assert!(!has_conflict(&es, &Span::new(jan(1) - DAY, jan(1)), None));
    }

    #[test]
    fn predicate_matches_half_open_overlap() {
        let mut es = EquipmentState::new(Ulid::new());
        held(&mut es, 100, 200, 0, Status::Confirmed);
        let existing = Span::new(100, 200);
        for s in 50..250 {
            for e in (s + 1)..260 {
                let candidate = Span::new(s, e);
                let expected = s < existing.end && existing.start < e;
                assert_eq!(has_conflict(&es, &candidate, None), expected, "[{s}, {e})");
            }
        }
    }

    #[test]
    fn terminal_reservations_never_conflict() {
        let mut es = EquipmentState::new(Ulid::new());
        held(&mut es, 100, 200, 0, Status::Completed);
        held(&mut es, 100, 200, 0, Status::Cancelled);
        assert!(!has_conflict(&es, &Span::new(150, 160), None));

        held(&mut es, 100, 200, 0, Status::Overdue);
        assert!(has_conflict(&es, &Span::new(150, 160), None));
    }

    #[test]
    fn exclude_ignores_own_record() {
        let mut es = EquipmentState::new(Ulid::new());
        let own = held(&mut es, 100, 200, 0, Status::Pending);
        assert!(has_conflict(&es, &Span::new(150, 250), None));
        assert!(!has_conflict(&es, &Span::new(150, 250), Some(own)));
    }

    #[test]
    fn free_unit_single_quantity() {
        let mut es = EquipmentState::new(Ulid::new());
        let existing = held(&mut es, 100, 200, 0, Status::Active);
        assert_eq!(free_unit(&es, &Span::new(200, 300), 1, None, None).unwrap(), 0);
        assert!(matches!(
            free_unit(&es, &Span::new(150, 300), 1, None, None),
            Err(EngineError::Conflict(id)) if id == existing
        ));
    }

    #[test]
    fn free_unit_multiple_quantity() {
        let mut es = EquipmentState::new(Ulid::new());
        held(&mut es, 100, 200, 0, Status::Confirmed);
        assert_eq!(free_unit(&es, &Span::new(150, 250), 2, None, None).unwrap(), 1);

        held(&mut es, 150, 250, 1, Status::Pending);
        assert!(matches!(
            free_unit(&es, &Span::new(120, 160), 2, None, None),
            Err(EngineError::Conflict(_))
        ));
        // Unit 0 frees up at 200
        assert_eq!(free_unit(&es, &Span::new(200, 300), 2, None, None).unwrap(), 0);
    }

    #[test]
    fn free_unit_prefers_current_unit() {
        let mut es = EquipmentState::new(Ulid::new());
        let own = held(&mut es, 100, 200, 2, Status::Pending);
        assert_eq!(free_unit(&es, &Span::new(100, 300), 3, Some(own), Some(2)).unwrap(), 2);
        // Preferred unit beyond the current quantity falls back to the lowest free one
        assert_eq!(free_unit(&es, &Span::new(100, 300), 2, Some(own), Some(2)).unwrap(), 0);
    }

    #[test]
    fn zero_quantity_is_unavailable() {
        let es = EquipmentState::new(Ulid::new());
        assert!(matches!(
            free_unit(&es, &Span::new(0, 10), 0, None, None),
            Err(EngineError::EquipmentUnavailable(_))
        ));
    }

    #[test]
    fn validate_span_bounds() {
        assert!(matches!(
            validate_span(&Span { start: jan(5), end: jan(5) }),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert!(matches!(
            validate_span(&Span { start: 0, end: 10 }),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        assert!(matches!(
            validate_span(&Span { start: jan(1), end: jan(1) + 400 * DAY }),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        assert!(validate_span(&Span::new(jan(1), jan(5))).is_ok());
    }
}

use std::cmp::Ordering;

use serde::Serialize;
use ulid::Ulid;

use crate::limits::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, MAX_UNITS_PER_EQUIPMENT};
use crate::model::*;
use crate::policy::{self, Action};

use super::conflict::{conflicting_reservations, free_unit, validate_span};
use super::{Engine, EngineError};

/// Answer to "would this interval fit?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalCheck {
    pub conflict: bool,
    /// Overlapping reservation ids; only filled in for admins.
    pub conflicting: Vec<Ulid>,
}

fn paginate<T>(mut items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> Page<T> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = offset.unwrap_or(0);
    let total = items.len();
    let items = if offset >= total {
        Vec::new()
    } else {
        items.drain(offset..total.min(offset + limit)).collect()
    };
    Page {
        items,
        total,
        offset,
        limit,
    }
}

fn matches_filter(r: &Reservation, f: &ReservationFilter) -> bool {
    f.user_id.is_none_or(|u| r.user_id == u)
        && f.status.is_none_or(|s| r.status == s)
        && f.from.is_none_or(|from| r.span.end >= from)
        && f.to.is_none_or(|to| r.span.start <= to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewKey {
    CreatedAt,
    UpdatedAt,
    Rating,
}

/// `(key, descending)` pairs, most significant first.
fn parse_review_sort(sort: Option<&str>) -> Result<Vec<(ReviewKey, bool)>, EngineError> {
    let mut keys = Vec::new();
    for part in sort.unwrap_or_default().split(',').map(str::trim) {
        if part.is_empty() {
            continue;
        }
        let (name, descending) = match part.strip_prefix('-') {
            Some(name) => (name, true),
            None => (part, false),
        };
        let key = match name {
            "createdAt" | "created_at" => ReviewKey::CreatedAt,
            "updatedAt" | "updated_at" => ReviewKey::UpdatedAt,
            "rating" => ReviewKey::Rating,
            _ => return Err(EngineError::InvalidSort(part.to_string())),
        };
        keys.push((key, descending));
    }
    if keys.is_empty() {
        keys.push((ReviewKey::CreatedAt, true));
    }
    Ok(keys)
}

fn compare_reviews(a: &Review, b: &Review, keys: &[(ReviewKey, bool)]) -> Ordering {
    keys.iter()
        .map(|&(key, descending)| {
            let ord = match key {
                ReviewKey::CreatedAt => a.created_at.cmp(&b.created_at),
                ReviewKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                ReviewKey::Rating => a.rating.cmp(&b.rating),
            };
            if descending { ord.reverse() } else { ord }
        })
        .find(|ord| ord.is_ne())
        .unwrap_or_else(|| b.id.cmp(&a.id))
}

impl Engine {
    pub async fn get_reservation(&self, actor: &Actor, id: Ulid) -> Result<Reservation, EngineError> {
        let guard = self.read_reservation_state(&id).await?;
        let r = guard.get(id).ok_or(EngineError::NotFound(id))?;
        policy::authorize(actor, r, Action::Read)?;
        Ok(r.clone())
    }

    /// Newest start first. Customers only ever see their own reservations.
    pub async fn list_reservations(
        &self,
        actor: &Actor,
        mut filter: ReservationFilter,
    ) -> Result<Page<Reservation>, EngineError> {
        if !actor.is_admin() {
            match filter.user_id {
                Some(uid) if uid != actor.id => return Err(EngineError::Forbidden),
                _ => filter.user_id = Some(actor.id),
            }
        }
        let equipment_ids = match filter.equipment_id {
            Some(eid) => vec![eid],
            None => self.store.equipment_ids(),
        };

        let mut found = Vec::new();
        for eid in equipment_ids {
            let Some(shared) = self.store.get_equipment(&eid) else {
                continue;
            };
            let guard = shared.read().await;
            found.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| matches_filter(r, &filter))
                    .cloned(),
            );
        }
        found.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
        Ok(paginate(found, filter.limit, filter.offset))
    }

    /// Would a create (or, with `exclude`, an edit) of `span` on `equipment_id` be
    /// rejected right now? Uses the catalog quantity, defaulting to a single unit.
    pub async fn has_conflict(
        &self,
        equipment_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        Ok(self.probe(equipment_id, span, exclude, false).await?.conflict)
    }

    /// [`Engine::has_conflict`] plus, for admins, the ids in the way.
    pub async fn check_interval(
        &self,
        actor: &Actor,
        equipment_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<IntervalCheck, EngineError> {
        self.probe(equipment_id, span, exclude, actor.is_admin()).await
    }

    async fn probe(
        &self,
        equipment_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
        with_ids: bool,
    ) -> Result<IntervalCheck, EngineError> {
        validate_span(&span)?;
        let quantity = self
            .catalog
            .lookup(equipment_id)
            .await
            .map_or(1, |info| info.quantity.min(MAX_UNITS_PER_EQUIPMENT));

        let Some(shared) = self.store.get_equipment(&equipment_id) else {
            return Ok(IntervalCheck {
                conflict: quantity == 0,
                conflicting: Vec::new(),
            });
        };
        let guard = shared.read().await;
        let conflict = match free_unit(&guard, &span, quantity, exclude, None) {
            Ok(_) => false,
            Err(EngineError::Conflict(_)) | Err(EngineError::EquipmentUnavailable(_)) => true,
            Err(e) => return Err(e),
        };
        let conflicting = if conflict && with_ids {
            conflicting_reservations(&guard, &span, exclude)
        } else {
            Vec::new()
        };
        Ok(IntervalCheck {
            conflict,
            conflicting,
        })
    }

    pub fn get_review(&self, review_id: Ulid) -> Result<Review, EngineError> {
        self.store
            .reservation_for_review(&review_id)
            .and_then(|reservation_id| self.store.review_for_reservation(&reservation_id))
            .filter(|r| r.id == review_id)
            .ok_or(EngineError::NotFound(review_id))
    }

    /// Reviews are public. Newest first unless `filter.sort` says otherwise.
    pub fn list_reviews(&self, filter: ReviewFilter) -> Result<Page<Review>, EngineError> {
        let keys = parse_review_sort(filter.sort.as_deref())?;
        let mut found: Vec<Review> = self
            .store
            .reviews_snapshot()
            .into_iter()
            .filter(|r| {
                filter.reservation_id.is_none_or(|id| r.reservation_id == id)
                    && filter.equipment_id.is_none_or(|id| r.equipment_id == id)
                    && filter.user_id.is_none_or(|id| r.user_id == id)
            })
            .collect();
        found.sort_by(|a, b| compare_reviews(a, b, &keys));
        Ok(paginate(found, filter.limit, filter.offset))
    }

    pub fn equipment_rating(&self, equipment_id: Ulid) -> RatingSummary {
        let ratings: Vec<u8> = self
            .store
            .reviews_snapshot()
            .into_iter()
            .filter(|r| r.equipment_id == equipment_id)
            .map(|r| r.rating)
            .collect();
        let count = ratings.len();
        let average = if count == 0 {
            0.0
        } else {
            let sum: u32 = ratings.iter().map(|&r| u32::from(r)).sum();
            (f64::from(sum) / count as f64 * 10.0).round() / 10.0
        };
        RatingSummary {
            equipment_id,
            average,
            count,
        }
    }
}

use serde::Serialize;
use ulid::Ulid;

use crate::limits::{MAX_REVIEW_COMMENT_LEN, MAX_REVIEW_TITLE_LEN};
use crate::model::*;
use crate::observability::REVIEWS_TOTAL;
use crate::policy;

use super::conflict::now_ms;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotOwner,
    IneligibleStatus,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Eligibility {
    Allowed { equipment_id: Ulid },
    Denied { reason: DenialReason },
}

/// Review gate. Only the owner may review, only in a reviewable status, and only once.
pub fn can_review(actor: &Actor, reservation: &Reservation, review_exists: bool) -> Eligibility {
    let reason = if !reservation.is_owned_by(actor) {
        DenialReason::NotOwner
    } else if !reservation.status.is_reviewable() {
        DenialReason::IneligibleStatus
    } else if review_exists {
        DenialReason::Duplicate
    } else {
        return Eligibility::Allowed {
            equipment_id: reservation.equipment_id,
        };
    };
    Eligibility::Denied { reason }
}

impl Eligibility {
    fn into_result(self, reservation: &Reservation) -> Result<Ulid, EngineError> {
        match self {
            Eligibility::Allowed { equipment_id } => Ok(equipment_id),
            Eligibility::Denied { reason } => Err(match reason {
                DenialReason::NotOwner => EngineError::Forbidden,
                DenialReason::IneligibleStatus => EngineError::IneligibleStatus {
                    id: reservation.id,
                    status: reservation.status,
                },
                DenialReason::Duplicate => EngineError::DuplicateReview(reservation.id),
            }),
        }
    }
}

fn validate_rating(rating: u8) -> Result<u8, EngineError> {
    if (1..=5).contains(&rating) {
        Ok(rating)
    } else {
        Err(EngineError::InvalidRating(rating))
    }
}

fn review_text(
    value: Option<String>,
    max: usize,
    what: &'static str,
) -> Result<Option<String>, EngineError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.chars().count() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

impl Engine {
    /// Advisory answer; `create_review` re-checks under the lock.
    pub async fn check_review_eligibility(
        &self,
        actor: &Actor,
        reservation_id: Ulid,
    ) -> Result<Eligibility, EngineError> {
        let guard = self.read_reservation_state(&reservation_id).await?;
        let reservation = guard
            .get(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        Ok(can_review(
            actor,
            reservation,
            self.store.has_review(&reservation_id),
        ))
    }

    /// The gate and the insert run under the equipment write lock, so two racing
    /// submissions for one reservation produce exactly one review.
    pub async fn create_review(
        &self,
        actor: &Actor,
        draft: ReviewDraft,
    ) -> Result<Review, EngineError> {
        let rating = validate_rating(draft.rating)?;
        let title = review_text(draft.title, MAX_REVIEW_TITLE_LEN, "review title too long")?;
        let comment = review_text(draft.comment, MAX_REVIEW_COMMENT_LEN, "review comment too long")?;

        let _commit = self.commit_gate.read().await;
        let (_, mut guard) = self.lock_reservation(&draft.reservation_id).await?;
        let reservation = guard
            .get(draft.reservation_id)
            .ok_or(EngineError::NotFound(draft.reservation_id))?;
        let equipment_id = can_review(
            actor,
            reservation,
            self.store.has_review(&draft.reservation_id),
        )
        .into_result(reservation)?;

        let now = now_ms();
        let review = Review {
            id: Ulid::new(),
            reservation_id: draft.reservation_id,
            equipment_id,
            user_id: reservation.user_id,
            rating,
            title,
            comment,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReviewCreated {
            review: review.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(REVIEWS_TOTAL, "op" => "create").increment(1);
        Ok(review)
    }

    pub async fn update_review(
        &self,
        actor: &Actor,
        review_id: Ulid,
        patch: ReviewPatch,
    ) -> Result<Review, EngineError> {
        let rating = patch.rating.map(validate_rating).transpose()?;
        let title = patch
            .title
            .map(|t| review_text(Some(t), MAX_REVIEW_TITLE_LEN, "review title too long"))
            .transpose()?;
        let comment = patch
            .comment
            .map(|c| review_text(Some(c), MAX_REVIEW_COMMENT_LEN, "review comment too long"))
            .transpose()?;

        let _commit = self.commit_gate.read().await;
        let (reservation_id, mut guard) = self.lock_review(&review_id).await?;
        let current = self
            .store
            .review_for_reservation(&reservation_id)
            .filter(|r| r.id == review_id)
            .ok_or(EngineError::NotFound(review_id))?;
        if !policy::can_modify_review(actor, &current) {
            return Err(EngineError::Forbidden);
        }

        let event = Event::ReviewUpdated {
            id: review_id,
            reservation_id,
            equipment_id: current.equipment_id,
            rating: rating.unwrap_or(current.rating),
            title: title.unwrap_or(current.title),
            comment: comment.unwrap_or(current.comment),
            updated_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(REVIEWS_TOTAL, "op" => "update").increment(1);
        self.store
            .review_for_reservation(&reservation_id)
            .ok_or(EngineError::NotFound(review_id))
    }

    pub async fn delete_review(&self, actor: &Actor, review_id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let (reservation_id, mut guard) = self.lock_review(&review_id).await?;
        let current = self
            .store
            .review_for_reservation(&reservation_id)
            .filter(|r| r.id == review_id)
            .ok_or(EngineError::NotFound(review_id))?;
        if !policy::can_modify_review(actor, &current) {
            return Err(EngineError::Forbidden);
        }

        let event = Event::ReviewDeleted {
            id: review_id,
            reservation_id,
            equipment_id: current.equipment_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(REVIEWS_TOTAL, "op" => "delete").increment(1);
        Ok(())
    }

    /// Review id → reservation id, then the owning equipment's write lock.
    async fn lock_review(
        &self,
        review_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<EquipmentState>), EngineError> {
        let reservation_id = self
            .store
            .reservation_for_review(review_id)
            .ok_or(EngineError::NotFound(*review_id))?;
        let (_, guard) = self
            .lock_reservation(&reservation_id)
            .await
            .map_err(|_| EngineError::NotFound(*review_id))?;
        Ok((reservation_id, guard))
    }
}

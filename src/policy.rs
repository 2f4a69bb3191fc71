//! Who may do what to a reservation.
//!
//! Every engine entry point calls [`authorize`] before touching state, so the
//! admin bypass and the ownership rules live here and nowhere else.

use crate::engine::EngineError;
use crate::model::{Actor, Reservation, Review, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    /// Change the interval or notes.
    EditFields,
    /// Any status change through the lifecycle table.
    Transition,
    /// Self-service move to `cancelled`.
    Cancel,
    Delete,
}

/// Pure decision: may `actor` perform `action` on `reservation`?
pub fn can_access(actor: &Actor, reservation: &Reservation, action: Action) -> bool {
    if actor.is_admin() {
        return true;
    }
    if !reservation.is_owned_by(actor) {
        return false;
    }
    match action {
        Action::Read | Action::Delete => true,
        Action::EditFields => !reservation.status.is_terminal(),
        Action::Cancel => matches!(reservation.status, Status::Pending | Status::Confirmed),
        Action::Transition => false,
    }
}

pub fn authorize(actor: &Actor, reservation: &Reservation, action: Action) -> Result<(), EngineError> {
    if can_access(actor, reservation, action) {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}

/// The action a transition to `target` requires.
pub fn transition_action(target: Status) -> Action {
    if target == Status::Cancelled {
        Action::Cancel
    } else {
        Action::Transition
    }
}

/// Review author or admin.
pub fn can_modify_review(actor: &Actor, review: &Review) -> bool {
    actor.is_admin() || review.user_id == actor.id
}

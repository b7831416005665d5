//! Legal task status transitions.
//!
//! PLAN tasks move `TODO → PLAN_RUNNING → PLAN_REVIEW`, then either to
//! `READY` (confirmed, switching the task to EXEC) or back to `TODO`
//! (revised). EXEC tasks move `TODO|READY → RUNNING → REVIEW → DONE`.
//! Running attempts may end in `FAILED` or `CANCELLED`; queued or reviewed
//! plans may be cancelled directly, and failed or cancelled tasks may be
//! retried back to `TODO`.

use crate::models::{TaskMode, TaskStatus};

pub fn is_valid_transition(mode: TaskMode, from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    let shared = matches!(
        (from, to),
        (Todo | Ready | PlanReview, Cancelled) | (Failed | Cancelled, Todo)
    );
    if shared {
        return true;
    }

    match mode {
        TaskMode::Plan => matches!(
            (from, to),
            (Todo, PlanRunning)
                | (PlanRunning, PlanReview | Failed | Cancelled)
                | (PlanReview, Ready | Todo)
        ),
        TaskMode::Exec => matches!(
            (from, to),
            (Todo | Ready, Running) | (Running, Review | Failed | Cancelled) | (Review, Done)
        ),
    }
}

/// Status a claimed task moves to when a worker picks it up.
pub fn claim_target(mode: TaskMode) -> TaskStatus {
    match mode {
        TaskMode::Plan => TaskStatus::PlanRunning,
        TaskMode::Exec => TaskStatus::Running,
    }
}

/// Whether a task in `status` is waiting for a worker.
pub fn is_claimable(mode: TaskMode, status: TaskStatus) -> bool {
    is_valid_transition(mode, status, claim_target(mode))
}

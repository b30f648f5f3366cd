//! Plan-date checks against iteration windows, and the deterministic repairs
//! applied when an iteration or a date moves.
//!
//! Everything here is pure. Callers load the iteration and state records
//! (normally through [`crate::cache::LookupCache`]) and pass them in, together
//! with the current instant, so results never depend on the wall clock.
//!
//! All comparisons are made at day granularity: an iteration window
//! `[started_at, finished_at]` contains every instant whose calendar day (UTC)
//! lies between the two boundary days, inclusive.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::error::ErrorCode;
use crate::model::{Belong, ExpiryStatus, Iteration, IterationId, State};

/// Invariant violations on plan dates or iteration placement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error(
        "{date} is outside iteration '{title}' ({iteration_id}) window {started} .. {finished}"
    )]
    OutOfIterationWindow {
        iteration_id: IterationId,
        title: String,
        started: NaiveDate,
        finished: NaiveDate,
        date: NaiveDate,
    },

    #[error("cannot place unfinished item ({belong}) in archived iteration '{title}' ({iteration_id})")]
    ArchivedIteration {
        iteration_id: IterationId,
        title: String,
        belong: Belong,
    },

    #[error("plan start {started} is after plan finish {finished}")]
    StartAfterFinish {
        started: NaiveDate,
        finished: NaiveDate,
    },
}

impl ScheduleError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::OutOfIterationWindow { .. } => ErrorCode::OutOfIterationWindow,
            Self::ArchivedIteration { .. } => ErrorCode::ArchivedIteration,
            Self::StartAfterFinish { .. } => ErrorCode::StartAfterFinish,
        }
    }
}

/// Midnight (UTC) of the day containing `t`.
#[must_use]
pub fn truncate_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn window_contains(iteration: &Iteration, t: DateTime<Utc>) -> bool {
    let day = t.date_naive();
    iteration.started_at.date_naive() <= day && day <= iteration.finished_at.date_naive()
}

/// Check that `t` falls inside the iteration window.
///
/// Passes trivially when either side is absent.
pub fn validate_within_iteration(
    iteration: Option<&Iteration>,
    t: Option<DateTime<Utc>>,
) -> Result<(), ScheduleError> {
    let (Some(iteration), Some(t)) = (iteration, t) else {
        return Ok(());
    };

    if window_contains(iteration, t) {
        Ok(())
    } else {
        Err(ScheduleError::OutOfIterationWindow {
            iteration_id: iteration.id,
            title: iteration.title.clone(),
            started: iteration.started_at.date_naive(),
            finished: iteration.finished_at.date_naive(),
            date: t.date_naive(),
        })
    }
}

/// Reject unfinished items inside a filed (archived) iteration.
pub fn validate_state_against_iteration(
    iteration: Option<&Iteration>,
    state: &State,
) -> Result<(), ScheduleError> {
    match iteration {
        Some(iteration) if iteration.is_filed() && !state.belong.is_finished() => {
            Err(ScheduleError::ArchivedIteration {
                iteration_id: iteration.id,
                title: iteration.title.clone(),
                belong: state.belong,
            })
        }
        _ => Ok(()),
    }
}

/// Plan start must not fall on a later day than plan finish.
pub fn validate_order(
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
) -> Result<(), ScheduleError> {
    match (started, finished) {
        (Some(s), Some(f)) if s.date_naive() > f.date_naive() => {
            Err(ScheduleError::StartAfterFinish {
                started: s.date_naive(),
                finished: f.date_naive(),
            })
        }
        _ => Ok(()),
    }
}

/// New plan finish for an item whose iteration changed: today when today is
/// inside the new window, otherwise the window's first day.
#[must_use]
pub fn adjust_plan_finished(
    trigger: bool,
    iteration: Option<&Iteration>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !trigger {
        return None;
    }
    let iteration = iteration?;

    if window_contains(iteration, now) {
        Some(truncate_to_day(now))
    } else {
        Some(truncate_to_day(iteration.started_at))
    }
}

/// New plan start when start was found after finish: the finish day itself.
#[must_use]
pub fn adjust_plan_started(
    trigger: bool,
    finished: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if !trigger {
        return None;
    }
    finished.map(truncate_to_day)
}

/// Derive the expiry bucket of a plan finish date as seen on `now`'s day.
#[must_use]
pub fn expiry_status(finished: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ExpiryStatus {
    let Some(finished) = finished else {
        return ExpiryStatus::Unspecified;
    };

    let days = (finished.date_naive() - now.date_naive()).num_days();
    match days {
        d if d < 0 => ExpiryStatus::Expired,
        0 => ExpiryStatus::ExpireIn1Day,
        1 => ExpiryStatus::ExpireIn2Days,
        2..=7 => ExpiryStatus::ExpireIn7Days,
        8..=30 => ExpiryStatus::ExpireIn30Days,
        _ => ExpiryStatus::ExpireInFuture,
    }
}

//! Best-effort compensation bookkeeping and the undo steps shared by sagas.

use std::fmt::Display;

use common::SlotId;
use domain::SessionRecord;
use futures_util::future::join_all;

use crate::services::{CalendarError, CalendarService, ContractService, HoldKey};

/// Outcome of a compensation pass.
///
/// Steps never abort the pass; each failure is logged and kept here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationResult {
    compensation_errors: Vec<String>,
}

impl CompensationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed compensation step.
    pub fn record(&mut self, step: &str, error: impl Display) {
        tracing::error!(step, error = %error, "Compensation step failed");
        metrics::counter!("saga_compensation_errors_total", "step" => step.to_string())
            .increment(1);
        self.compensation_errors.push(format!("{step}: {error}"));
    }

    /// Some step failed; cross-domain state may be inconsistent.
    pub fn require_manual_intervention(&self) -> bool {
        !self.compensation_errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.compensation_errors
    }

    /// The original failure, followed by any compensation errors.
    pub fn failure_message(&self, original: &impl Display) -> String {
        if self.compensation_errors.is_empty() {
            original.to_string()
        } else {
            format!(
                "{original}; compensation errors: {}",
                self.compensation_errors.join("; ")
            )
        }
    }
}

/// Cancels the given slots concurrently.
///
/// Slots that are already cancelled count as cancelled.
pub async fn cancel_slots(
    calendar: &dyn CalendarService,
    slot_ids: &[SlotId],
    result: &mut CompensationResult,
) {
    let cancellations = slot_ids.iter().map(|slot_id| async move {
        (*slot_id, calendar.cancel_slot(*slot_id).await)
    });

    for (slot_id, outcome) in join_all(cancellations).await {
        match outcome {
            Ok(()) | Err(CalendarError::AlreadyCancelled(_)) => {}
            Err(e) => result.record(&format!("cancel_slot {slot_id}"), e),
        }
    }
}

/// Releases the active hold of a booking, if there is one.
///
/// Group sessions carry no hold.
pub async fn release_booking_hold(
    contracts: &dyn ContractService,
    session: &SessionRecord,
    reason: &str,
    result: &mut CompensationResult,
) {
    if session.kind.is_group() {
        return;
    }
    let Some(student_id) = session.student_id else {
        return;
    };
    let key = HoldKey {
        student_id,
        service_type: session.service_type_code.clone(),
        related_booking_id: session.id,
    };

    match contracts.find_active_hold(&key).await {
        Ok(Some(hold)) => {
            if let Err(e) = contracts.release_hold(hold.id, reason, None).await {
                result.record("release_hold", e);
            }
        }
        Ok(None) => {
            tracing::debug!(session_id = %session.id, "No active hold to release");
        }
        Err(e) => result.record("find_active_hold", e),
    }
}

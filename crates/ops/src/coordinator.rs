//! Cancellation Coordinator: picks the cancel scope and asks for confirmation
//! before anything destructive leaves the client.

#![forbid(unsafe_code)]

use std::sync::Arc;

use crcwatch_api::{ApiResult, DashboardApi};
use crcwatch_core::{CancelRequest, CrcId, Snapshot};
use crcwatch_search::CancelScope;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dialog::{ButtonStyle, Dialog, DialogError, DialogHost};

const ALL_TESTPLANS: &str = "These CaseRunConfigurations will be canceled in all testplans.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    AwaitingConfirmation,
    Dispatching,
}

/// What a dialog button does once pressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAction {
    Dispatch(CancelRequest),
    Decline,
    Acknowledge,
}

/// Result of a cancel request or of a dialog choice.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The request was sent; the handle resolves when the server answered.
    Dispatched(JoinHandle<ApiResult<()>>),
    /// A confirmation dialog is open.
    AwaitingConfirmation,
    /// The operator said no; nothing was sent.
    Declined,
    /// An informational alert was acknowledged.
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("a dialog is waiting for an answer")]
    Busy,
    #[error("no filtered configurations to cancel")]
    NothingToCancel,
    #[error("filtered cancel is not available on this dashboard")]
    FilterUnavailable,
    #[error(transparent)]
    Dialog(#[from] DialogError),
}

pub struct Coordinator {
    api: Arc<dyn DashboardApi>,
    dialogs: DialogHost<ConfirmAction>,
    state: CoordinatorState,
}

impl Coordinator {
    pub fn new(api: Arc<dyn DashboardApi>) -> Self {
        Self { api, dialogs: DialogHost::new(), state: CoordinatorState::Idle }
    }

    pub fn state(&self) -> CoordinatorState { self.state }

    /// The open dialog, if any.
    pub fn dialog(&self) -> Option<&Dialog<ConfirmAction>> { self.dialogs.current() }

    fn ensure_idle(&self) -> Result<(), CoordinatorError> {
        if self.state != CoordinatorState::Idle {
            return Err(CoordinatorError::Busy);
        }
        Ok(())
    }

    /// Cancel one configuration everywhere it runs. Confirmation is asked
    /// only when it runs in more than one plan.
    pub fn cancel_one(&mut self, crc_id: &str, snap: &Snapshot) -> Result<CancelOutcome, CoordinatorError> {
        self.ensure_idle()?;
        let request = CancelRequest::Crc { crc_id: crc_id.to_string() };
        match snap.get(crc_id).filter(|c| c.is_shared()) {
            Some(crc) => {
                let body = format!(
                    "This CaseRunConfiguration is in {} testplans ({}). Do you want to cancel it in all testplans?",
                    crc.running_for.len(),
                    crc.running_for.join(", ")
                );
                self.confirm(format!("Cancel {}", crc_id), body, request)
            }
            None => Ok(self.dispatch(request)),
        }
    }

    pub fn cancel_plan(&mut self, plan_name: &str) -> Result<CancelOutcome, CoordinatorError> {
        self.ensure_idle()?;
        let body = format!("Do you really want to cancel whole testplan?<br>{}", ALL_TESTPLANS);
        self.confirm(format!("Cancel {}", plan_name), body, CancelRequest::Plan { plan_name: plan_name.to_string() })
    }

    pub fn cancel_all(&mut self) -> Result<CancelOutcome, CoordinatorError> {
        self.ensure_idle()?;
        self.confirm("Cancel all".to_string(), "Do you really want to cancel everything?".to_string(), CancelRequest::All)
    }

    /// Cancel the matched ids. `plan_name` is passed along for the server's
    /// bookkeeping. Refusals are shown as an alert.
    pub fn cancel_filtered(&mut self, crc_ids: &[CrcId], plan_name: Option<&str>) -> Result<CancelOutcome, CoordinatorError> {
        self.ensure_idle()?;
        if !self.api.supports_filtered_cancel() {
            self.alert("Cancelling filtered CaseRunConfigurations is not available on this dashboard.")?;
            return Err(CoordinatorError::FilterUnavailable);
        }
        if crc_ids.is_empty() {
            self.alert("No CaseRunConfiguration matches the current filter; nothing was canceled.")?;
            return Err(CoordinatorError::NothingToCancel);
        }
        let request = CancelRequest::Filtered { crc_ids: crc_ids.to_vec(), plan_name: plan_name.map(str::to_string) };
        match plan_name {
            Some(plan) => self.confirm(
                format!("Cancel filtered {}", plan),
                format!("Do you really want to cancel all filtered CaseRunConfigurations from this testplan?<br>{}", ALL_TESTPLANS),
                request,
            ),
            None => self.confirm(
                "Cancel all filtered".to_string(),
                format!("Do you really want to cancel all filtered CaseRunConfigurations?<br>{}", ALL_TESTPLANS),
                request,
            ),
        }
    }

    /// Route a button scope from the filter controller.
    pub fn cancel_scope(&mut self, scope: &CancelScope) -> Result<CancelOutcome, CoordinatorError> {
        match scope {
            CancelScope::All => self.cancel_all(),
            CancelScope::Plan(plan) => self.cancel_plan(plan),
            CancelScope::Filtered { crc_ids, plan_name } => self.cancel_filtered(crc_ids, plan_name.as_deref()),
        }
    }

    /// Answer the open dialog.
    pub fn press(&mut self, button_id: &str) -> Result<CancelOutcome, CoordinatorError> {
        let action = self.dialogs.press(button_id)?;
        self.state = CoordinatorState::Idle;
        Ok(match action {
            ConfirmAction::Dispatch(request) => self.dispatch(request),
            ConfirmAction::Decline => {
                metrics::counter!("cancel_declined_total", 1u64);
                info!("cancel: declined");
                CancelOutcome::Declined
            }
            ConfirmAction::Acknowledge => CancelOutcome::Acknowledged,
        })
    }

    /// Dismiss the open dialog; counts as declining.
    pub fn dismiss(&mut self) -> Result<CancelOutcome, CoordinatorError> {
        self.dialogs.close()?;
        self.state = CoordinatorState::Idle;
        metrics::counter!("cancel_declined_total", 1u64);
        info!("cancel: dialog dismissed");
        Ok(CancelOutcome::Declined)
    }

    fn confirm(&mut self, title: String, body: String, request: CancelRequest) -> Result<CancelOutcome, CoordinatorError> {
        let dialog = Dialog::new("modal_confirm", Some(title), body)
            .button("yes", "Yes", ButtonStyle::Primary, ConfirmAction::Dispatch(request))
            .button("no", "No", ButtonStyle::Danger, ConfirmAction::Decline);
        self.dialogs.open(dialog)?;
        self.state = CoordinatorState::AwaitingConfirmation;
        Ok(CancelOutcome::AwaitingConfirmation)
    }

    fn alert(&mut self, body: &str) -> Result<(), CoordinatorError> {
        self.dialogs.open(Dialog::alert(body, ConfirmAction::Acknowledge))?;
        self.state = CoordinatorState::AwaitingConfirmation;
        Ok(())
    }

    // Fire and forget: the next poll shows whether the cancel took effect.
    fn dispatch(&mut self, request: CancelRequest) -> CancelOutcome {
        self.state = CoordinatorState::Dispatching;
        let scope = request.scope();
        metrics::counter!("cancel_dispatched_total", 1u64, "scope" => scope);
        info!(scope, "cancel: dispatching");
        let api = Arc::clone(&self.api);
        let handle = tokio::spawn(async move {
            let res = api.cancel(&request).await;
            if let Err(e) = &res {
                warn!(scope = request.scope(), error = %e, "cancel: request failed");
            }
            res
        });
        self.state = CoordinatorState::Idle;
        CancelOutcome::Dispatched(handle)
    }
}

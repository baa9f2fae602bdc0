//! crcwatch ops: the Cancellation Coordinator and the modal dialogs it confirms through.

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod dialog;

pub use coordinator::{CancelOutcome, ConfirmAction, Coordinator, CoordinatorError, CoordinatorState};
pub use dialog::{Button, ButtonStyle, Dialog, DialogError, DialogHost, DialogView};

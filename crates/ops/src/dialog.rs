//! Single exclusive modal: confirm dialogs with action buttons and alerts.

#![forbid(unsafe_code)]

use serde::Serialize;
use tracing::debug;

/// Visual weight of a button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ButtonStyle {
    Primary,
    Danger,
    Secondary,
}

#[derive(Debug, Clone)]
pub struct Button<A> {
    pub id: String,
    pub label: String,
    pub style: ButtonStyle,
    action: A,
}

/// A modal with a title, a body and buttons carrying actions.
#[derive(Debug, Clone)]
pub struct Dialog<A> {
    pub id: String,
    pub title: Option<String>,
    /// Body text; may carry `<br>` line breaks.
    pub body: String,
    pub buttons: Vec<Button<A>>,
    /// Whether it can be dismissed without pressing a button.
    pub closeable: bool,
}

impl<A> Dialog<A> {
    pub fn new(id: impl Into<String>, title: Option<String>, body: impl Into<String>) -> Self {
        Self { id: id.into(), title, body: body.into(), buttons: Vec::new(), closeable: true }
    }

    pub fn button(mut self, id: &str, label: &str, style: ButtonStyle, action: A) -> Self {
        self.buttons.push(Button { id: id.into(), label: label.into(), style, action });
        self
    }

    pub fn closeable(mut self, closeable: bool) -> Self { self.closeable = closeable; self }

    /// Informational text with a single acknowledging button; not closeable.
    pub fn alert(body: impl Into<String>, ack: A) -> Self {
        Dialog::new("modal_alert", None, body).button("ok", "OK", ButtonStyle::Primary, ack).closeable(false)
    }

    pub fn view(&self) -> DialogView {
        DialogView {
            id: self.id.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            buttons: self.buttons.iter().map(|b| (b.id.clone(), b.label.clone(), b.style)).collect(),
            closeable: self.closeable,
        }
    }
}

/// Action-free copy of a dialog for render surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialogView {
    pub id: String,
    pub title: Option<String>,
    pub body: String,
    /// `(id, label, style)`
    pub buttons: Vec<(String, String, ButtonStyle)>,
    pub closeable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialogError {
    #[error("a dialog is already open")]
    AlreadyOpen,
    #[error("no dialog is open")]
    NoneOpen,
    #[error("no button {0:?}")]
    UnknownButton(String),
    #[error("dialog cannot be closed without a choice")]
    NotCloseable,
}

/// Holds at most one open dialog. Pressing a button tears the dialog down and
/// hands out its action, so each action is taken at most once.
#[derive(Debug)]
pub struct DialogHost<A> {
    open: Option<Dialog<A>>,
}

impl<A> Default for DialogHost<A> {
    fn default() -> Self { Self { open: None } }
}

impl<A> DialogHost<A> {
    pub fn new() -> Self { Self::default() }

    pub fn is_open(&self) -> bool { self.open.is_some() }

    pub fn current(&self) -> Option<&Dialog<A>> { self.open.as_ref() }

    pub fn open(&mut self, dialog: Dialog<A>) -> Result<(), DialogError> {
        if self.open.is_some() {
            return Err(DialogError::AlreadyOpen);
        }
        debug!(id = %dialog.id, buttons = dialog.buttons.len(), "dialog: opened");
        self.open = Some(dialog);
        Ok(())
    }

    pub fn press(&mut self, button_id: &str) -> Result<A, DialogError> {
        let dialog = self.open.as_ref().ok_or(DialogError::NoneOpen)?;
        let idx = dialog
            .buttons
            .iter()
            .position(|b| b.id == button_id)
            .ok_or_else(|| DialogError::UnknownButton(button_id.to_string()))?;
        let mut dialog = self.open.take().ok_or(DialogError::NoneOpen)?;
        debug!(id = %dialog.id, button = button_id, "dialog: pressed");
        Ok(dialog.buttons.swap_remove(idx).action)
    }

    /// Dismiss without choosing; only closeable dialogs allow it.
    pub fn close(&mut self) -> Result<(), DialogError> {
        match &self.open {
            None => Err(DialogError::NoneOpen),
            Some(d) if !d.closeable => Err(DialogError::NotCloseable),
            Some(d) => {
                debug!(id = %d.id, "dialog: closed");
                self.open = None;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm() -> Dialog<&'static str> {
        Dialog::new("modal_confirm", Some("Cancel all".into()), "Do you really want to cancel everything?")
            .button("yes", "Yes", ButtonStyle::Primary, "dispatch")
            .button("no", "No", ButtonStyle::Danger, "decline")
    }

    #[test]
    fn second_open_is_refused() {
        let mut host = DialogHost::new();
        host.open(confirm()).unwrap();
        assert_eq!(host.open(confirm()), Err(DialogError::AlreadyOpen));
        assert_eq!(host.current().map(|d| d.id.as_str()), Some("modal_confirm"));
    }

    #[test]
    fn pressing_tears_down_and_yields_action_once() {
        let mut host = DialogHost::new();
        host.open(confirm()).unwrap();
        assert_eq!(host.press("maybe"), Err(DialogError::UnknownButton("maybe".into())));
        assert!(host.is_open());
        assert_eq!(host.press("no"), Ok("decline"));
        assert!(!host.is_open());
        assert_eq!(host.press("yes"), Err(DialogError::NoneOpen));
    }

    #[test]
    fn alerts_need_acknowledgement() {
        let mut host = DialogHost::new();
        host.open(Dialog::alert("Filtered cancel is unavailable.", ())).unwrap();
        let view = host.current().map(|d| d.view()).unwrap();
        assert_eq!(view.id, "modal_alert");
        assert_eq!(view.title, None);
        assert_eq!(view.buttons, vec![("ok".to_string(), "OK".to_string(), ButtonStyle::Primary)]);
        assert_eq!(host.close(), Err(DialogError::NotCloseable));
        assert_eq!(host.press("ok"), Ok(()));
        assert_eq!(host.close(), Err(DialogError::NoneOpen));
    }

    #[test]
    fn closeable_dialogs_close_without_action() {
        let mut host = DialogHost::new();
        host.open(confirm()).unwrap();
        assert_eq!(host.close(), Ok(()));
        assert!(host.current().is_none());
    }
}

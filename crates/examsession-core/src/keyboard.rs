//! Keyboard shortcuts.
//!
//! A thin translation from key presses to [`SessionAction`]s. The controller
//! executes them through the same entry point pointer input uses, so no
//! session rule lives here.

use crate::controller::SessionAction;

/// A key press, reduced to what the shortcuts care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    ArrowLeft,
    ArrowRight,
    Enter,
    Escape,
    Char(char),
}

/// Context needed to interpret a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyContext {
    /// A text field has focus; keys belong to it.
    pub text_input_focused: bool,
    /// The submit confirmation is open.
    pub confirming: bool,
}

/// Map a key press to a session action, if it is a shortcut here.
///
/// Digits 1-9 jump to the first nine questions.
pub fn action_for(key: Key, ctx: KeyContext) -> Option<SessionAction> {
    if ctx.text_input_focused {
        return None;
    }
    match key {
        Key::ArrowRight => Some(SessionAction::Next),
        Key::ArrowLeft => Some(SessionAction::Previous),
        Key::Enter if ctx.confirming => Some(SessionAction::ConfirmSubmit),
        Key::Escape if ctx.confirming => Some(SessionAction::CancelSubmit),
        Key::Char(c) => match c.to_ascii_lowercase() {
            'n' => Some(SessionAction::Next),
            'p' => Some(SessionAction::Previous),
            'f' => Some(SessionAction::ToggleFlag),
            's' => Some(SessionAction::RequestSubmit),
            d @ '1'..='9' => Some(SessionAction::JumpTo(d as usize - '1' as usize)),
            _ => None,
        },
        _ => None,
    }
}

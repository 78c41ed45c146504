//! The capability the orchestrator needs from whatever presents the
//! password prompt and connection status to the user. The concrete GUI
//! is out of scope for this crate; `NullUi` is a logging stand-in for
//! headless operation, and `test_support::RecordingUi` is a test double.

/// Notifications the orchestrator sends as it moves through its states.
pub trait Ui: Send + 'static {
    /// The prompt (or any status window) should be dismissed.
    fn hide(&mut self);

    /// Ask the user for the token's unlock password. `error`, if set, is
    /// the reason the previous attempt failed and should be shown inline.
    fn show_password_prompt(&mut self, error: Option<&str>);

    /// A code is being computed and the connection is being established.
    fn show_connecting(&mut self);
}

/// Headless `Ui`: logs transitions instead of rendering anything.
pub struct NullUi;

impl Ui for NullUi {
    fn hide(&mut self) {
        log::debug!("ui: hide");
    }

    fn show_password_prompt(&mut self, error: Option<&str>) {
        match error {
            Some(msg) => log::info!("ui: prompting for password again ({msg})"),
            None => log::info!("ui: prompting for password"),
        }
    }

    fn show_connecting(&mut self) {
        log::info!("ui: connecting");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Ui;
    use std::sync::{Arc, Mutex};

    /// Records every call made to it, for assertion from outside the
    /// `Controller` that owns the other clone.
    #[derive(Clone)]
    pub struct RecordingUi {
        events: Arc<Mutex<Vec<&'static str>>>,
        last_error: Arc<Mutex<Option<String>>>,
    }

    impl RecordingUi {
        pub fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                last_error: Arc::new(Mutex::new(None)),
            }
        }

        pub fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        pub fn last_error(&self) -> Option<String> {
            self.last_error.lock().unwrap().clone()
        }
    }

    impl Ui for RecordingUi {
        fn hide(&mut self) {
            self.events.lock().unwrap().push("hide");
        }

        fn show_password_prompt(&mut self, error: Option<&str>) {
            *self.last_error.lock().unwrap() = error.map(str::to_string);
            self.events.lock().unwrap().push("ask");
        }

        fn show_connecting(&mut self) {
            self.events.lock().unwrap().push("connecting");
        }
    }
}

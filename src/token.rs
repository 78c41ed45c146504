//! The `Token` capability: an opaque handle bound to a connected card,
//! offering `get_code`. Kept as an explicit trait object so the
//! orchestrator can be exercised against a mock in tests instead of a
//! real smart card.

use std::future::Future;
use std::pin::Pin;

use crate::apdu::CardHandle;
use crate::error::CardError;
use crate::oath;

pub trait Token: Send + Sync {
    /// Runs the OATH retrieval sequence for `slot_name` using `password`
    /// to unlock the token.
    fn get_code<'a>(
        &'a self,
        password: &'a str,
        slot_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, CardError>> + Send + 'a>>;
}

/// The production `Token`: a connected PC/SC card handle.
pub struct CardToken {
    card: CardHandle,
}

impl CardToken {
    pub fn new(card: CardHandle) -> Self {
        Self { card }
    }
}

impl Token for CardToken {
    fn get_code<'a>(
        &'a self,
        password: &'a str,
        slot_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, CardError>> + Send + 'a>> {
        Box::pin(oath::get_code(&self.card, password, slot_name))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A scripted `Token` for FSM tests: returns the next queued result
    /// on each `get_code` call, or `CardError::SlotNotFound` once
    /// exhausted.
    pub struct MockToken {
        responses: Mutex<VecDeque<Result<String, CardError>>>,
    }

    impl MockToken {
        /// Responses are consumed in order, first call first.
        pub fn new(responses: Vec<Result<String, CardError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    impl Token for MockToken {
        fn get_code<'a>(
            &'a self,
            _password: &'a str,
            _slot_name: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, CardError>> + Send + 'a>> {
            let next = self.responses.lock().unwrap().pop_front();
            Box::pin(async move { next.unwrap_or(Err(CardError::SlotNotFound)) })
        }
    }

    /// A `Token` whose `get_code` never resolves, for exercising
    /// cancellation of an in-flight connection attempt.
    pub struct HangingToken;

    impl Token for HangingToken {
        fn get_code<'a>(
            &'a self,
            _password: &'a str,
            _slot_name: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, CardError>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }
}

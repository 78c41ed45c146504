//! Closed error taxonomy for the OATH-over-smart-card exchange and its
//! callers.

use thiserror::Error;

/// Errors that can occur while sending or interpreting an APDU, or while
/// carrying out the OATH `get_code` exchange on top of it.
#[derive(Debug, Error)]
pub enum CardError {
    /// APDU status word was not `0x9000`, and no more specific meaning is
    /// known for it. The raw response body (status word included) is kept
    /// so callers can inspect it, e.g. for `6A 80`.
    #[error("card returned unexpected status word (this is a bug unless the caller reclassifies it)")]
    ChkWrong { body: Vec<u8> },

    /// `VALIDATE` came back with `6A 80`: the unlock password is wrong.
    #[error("wrong YubiKey password")]
    WrongPassword,

    /// The user dismissed the password prompt or pressed Escape.
    #[error("user canceled")]
    UserCancelled,

    /// `CALCULATE_ALL` never reported a `NAME` matching the requested slot.
    #[error("no slot with the specified name was found")]
    SlotNotFound,

    /// The token authenticated itself with a different HMAC than the one we
    /// derived; no correctable recovery exists for this condition.
    #[error("card validation response did not match the expected verification")]
    VerificationFailed,

    /// The underlying PC/SC card handle reported a reset.
    #[error("card was reset")]
    CardReset,

    /// The VPN launcher process exited leaving stderr output.
    #[error("VPN launcher failed: {0}")]
    LauncherFailure(String),

    /// PC/SC context or reader I/O error. Self-healed by the reader monitor;
    /// not normally surfaced to the FSM.
    #[error("PC/SC transport error: {0}")]
    Transport(#[from] pcsc::Error),
}

impl CardError {
    /// True if this is exactly the wrong-password condition signalled by the
    /// card as `ChkWrong { body: [0x6A, 0x80] }`.
    pub fn is_wrong_password_chk(&self) -> bool {
        matches!(self, CardError::ChkWrong { body } if body.as_slice() == [0x6A, 0x80])
    }
}

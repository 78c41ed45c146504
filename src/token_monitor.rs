//! Token Monitor (C4): filters reader presence events down to
//! YubiKey-class tokens and opens card handles for them.

use std::ffi::CString;
use std::sync::Arc;

use pcsc::{Context, Protocols, Scope, ShareMode};
use tokio_util::sync::CancellationToken;

use crate::apdu::CardHandle;
use crate::error::CardError;
use crate::reader_monitor::{Monitor, PresenceEvent};
use crate::token::{CardToken, Token};

/// A card insertion accepted by the filter policy, not yet connected to.
pub struct InsertionEvent {
    pub reader_id: String,
    pub scope: CancellationToken,
}

impl InsertionEvent {
    /// Establishes a fresh PC/SC context, connects to the reader in
    /// shared mode, and binds the resulting handle to this event's scope.
    pub fn open(&self) -> Result<Arc<dyn Token>, CardError> {
        let ctx = Context::establish(Scope::User)?;
        let reader_name = CString::new(self.reader_id.as_bytes())
            .map_err(|_| CardError::Transport(pcsc::Error::InvalidValue))?;
        let card = ctx.connect(&reader_name, ShareMode::Shared, Protocols::ANY)?;
        Ok(Arc::new(CardToken::new(CardHandle::new(card))))
    }
}

/// Wraps a `Monitor`, yielding only `InsertionEvent`s that pass the
/// configured reader-filter policy.
pub struct TokenMonitor {
    monitor: Monitor,
}

impl TokenMonitor {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            monitor: Monitor::new(parent),
        }
    }

    /// Awaits the next accepted insertion. Removal events carry no
    /// payload of interest: the scope issued on `Available` already
    /// propagates the removal via cancellation.
    pub async fn recv(&mut self) -> Option<InsertionEvent> {
        loop {
            match self.monitor.recv().await? {
                PresenceEvent::Available { reader_id, scope } => {
                    if accepts_reader(&reader_id) {
                        return Some(InsertionEvent { reader_id, scope });
                    }
                }
                PresenceEvent::Removed { .. } => {}
            }
        }
    }
}

#[cfg(all(feature = "filter-name", feature = "filter-vidpid"))]
compile_error!("features \"filter-name\" and \"filter-vidpid\" are mutually exclusive; pick one reader-filter policy with --no-default-features --features filter-vidpid");

#[cfg(not(any(feature = "filter-name", feature = "filter-vidpid")))]
compile_error!("one of the \"filter-name\" or \"filter-vidpid\" features must be enabled to choose a reader-filter policy");

#[cfg(all(feature = "filter-name", not(feature = "filter-vidpid")))]
fn accepts_reader(reader_id: &str) -> bool {
    reader_id.to_lowercase().contains("yubi")
}

#[cfg(all(feature = "filter-vidpid", not(feature = "filter-name")))]
fn accepts_reader(_reader_id: &str) -> bool {
    const YUBICO_VID: u16 = 0x1050;
    const YUBIKEY_PID: u16 = 0x0407;

    match rusb::devices() {
        Ok(list) => list.iter().any(|dev| {
            dev.device_descriptor()
                .map(|desc| desc.vendor_id() == YUBICO_VID && desc.product_id() == YUBIKEY_PID)
                .unwrap_or(false)
        }),
        Err(e) => {
            log::warn!("failed to enumerate USB devices for token filter: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(all(feature = "filter-name", not(feature = "filter-vidpid")))]
    #[test]
    fn accepts_reader_matches_case_insensitive_substring() {
        assert!(accepts_reader("Yubico YubiKey OTP+FIDO+CCID 0"));
        assert!(accepts_reader("some YUBI reader"));
        assert!(!accepts_reader("Alcor Micro AU9540"));
    }
}

//! Reader Monitor (C1): tracks the set of connected PC/SC readers and
//! emits presence-change events with per-reader cancellation scopes.

use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use pcsc::{Context, ReaderState, Scope, State as PcscState, PNP_NOTIFICATION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CONTEXT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A presence transition for a single reader.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// A card became present in `reader_id`. `scope` is cancelled no
    /// later than the matching `Removed` event.
    Available {
        reader_id: String,
        scope: CancellationToken,
    },
    Removed { reader_id: String },
}

/// Runs the reader-monitor loop and exposes its event stream.
pub struct Monitor {
    events: mpsc::UnboundedReceiver<PresenceEvent>,
}

impl Monitor {
    /// Starts the monitor immediately on a dedicated OS thread, since the
    /// underlying `GetStatusChange` call blocks for an unbounded duration.
    pub fn new(parent: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || run(parent, tx));
        Self { events: rx }
    }

    /// Receives the next presence event. Returns `None` once the parent
    /// scope has been cancelled and the monitor thread has exited.
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        self.events.recv().await
    }
}

/// Bookkeeping for one non-pseudo reader: the cancellation scope handed
/// out in its `Available` event, released on `Removed`.
struct TrackedReader {
    scope: CancellationToken,
}

fn run(parent: CancellationToken, tx: mpsc::UnboundedSender<PresenceEvent>) {
    let pnp_name = PNP_NOTIFICATION();

    'reconnect: loop {
        if parent.is_cancelled() {
            return;
        }

        let ctx = match Context::establish(Scope::User) {
            Ok(ctx) => ctx,
            Err(e) => {
                log::warn!("failed to establish PC/SC context: {e}; retrying");
                std::thread::sleep(CONTEXT_RETRY_BACKOFF);
                continue;
            }
        };

        let mut states: Vec<ReaderState> = vec![ReaderState::new(pnp_name, PcscState::UNAWARE)];
        let mut tracked: HashMap<String, TrackedReader> = HashMap::new();
        let mut device_list_outdated = true;
        let mut readers_buf = [0u8; 2048];

        loop {
            if parent.is_cancelled() {
                return;
            }

            if device_list_outdated {
                match ctx.list_readers(&mut readers_buf) {
                    Ok(names) => {
                        let current: Vec<CString> = names.map(|n| n.to_owned()).collect();
                        // Drop states for readers no longer listed (besides the pseudo reader).
                        states.retain(|rs| rs.name() == pnp_name || current.iter().any(|n| n.as_c_str() == rs.name()));
                        for name in &current {
                            if !states.iter().any(|rs| rs.name() == name.as_c_str()) {
                                states.push(ReaderState::new(name.as_c_str(), PcscState::UNAWARE));
                            }
                        }
                        device_list_outdated = false;
                    }
                    Err(e) => {
                        log::warn!("failed to list readers: {e}");
                        continue 'reconnect;
                    }
                }
            }

            match ctx.get_status_change(None, &mut states) {
                Ok(()) => {}
                Err(pcsc::Error::UnknownReader) => {
                    device_list_outdated = true;
                    continue;
                }
                Err(e) => {
                    log::warn!("get_status_change failed: {e}; rebuilding context");
                    continue 'reconnect;
                }
            }

            for rs in &states {
                if rs.name() == pnp_name {
                    if rs.event_state().contains(PcscState::CHANGED) {
                        device_list_outdated = true;
                    }
                    continue;
                }

                let reader_id = rs.name().to_string_lossy().into_owned();
                let was_present = tracked.contains_key(&reader_id);
                let is_present = rs.event_state().contains(PcscState::PRESENT);

                if !was_present && is_present {
                    let scope = parent.child_token();
                    tracked.insert(reader_id.clone(), TrackedReader { scope: scope.clone() });
                    let _ = tx.send(PresenceEvent::Available {
                        reader_id,
                        scope,
                    });
                } else if was_present && !is_present {
                    if let Some(entry) = tracked.remove(&reader_id) {
                        entry.scope.cancel();
                    }
                    let _ = tx.send(PresenceEvent::Removed { reader_id });
                }
            }

            for rs in &mut states {
                rs.sync_current_state();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_closes_stream_when_parent_cancelled_before_start() {
        let parent = CancellationToken::new();
        parent.cancel();
        let mut monitor = Monitor::new(parent);
        assert!(monitor.recv().await.is_none());
    }
}

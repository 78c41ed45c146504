//! Unlocks a YubiKey-class OATH token and hands a TOTP code to a
//! host-native VPN launcher. See [`orchestrator`] for the state machine
//! tying the pieces below together.

pub mod apdu;
pub mod cli;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod oath;
pub mod orchestrator;
pub mod reader_monitor;
pub mod tlv;
pub mod token;
pub mod token_monitor;
pub mod ui;

use tokio_util::sync::CancellationToken;

use orchestrator::{Controller, Event as OrchEvent, EventSender};
use token_monitor::{InsertionEvent, TokenMonitor};
use ui::NullUi;

/// Runs the application to completion and returns the process exit code.
///
/// Wires the token monitor, the orchestrator FSM, and the VPN launcher
/// adapter together, then blocks until `Ctrl-C` asks for shutdown.
/// Per-token errors (a card that will not open, a failed connection
/// attempt) are logged and do not terminate the process, matching the
/// CLI's documented exit-code contract: only flag-parse errors exit
/// non-zero.
pub async fn run() -> i32 {
    let options = cli::parse();
    logging::setup_logging(options.debug);

    let root = CancellationToken::new();
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let (controller, events) = Controller::new(NullUi, outbound_tx);
    let controller_task = tokio::spawn(controller.run());
    let launcher_task = tokio::spawn(drive_launcher(outbound_rx));

    let mut monitor = TokenMonitor::new(root.child_token());
    let connection_id = options.connection;
    let slot_name = options.slot;

    tokio::select! {
        _ = async {
            while let Some(insertion) = monitor.recv().await {
                tokio::spawn(handle_insertion(
                    insertion,
                    events.clone(),
                    connection_id.clone(),
                    slot_name.clone(),
                ));
            }
        } => {
            log::warn!("reader monitor stream ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
        }
    }

    root.cancel();
    drop(events);
    controller_task.abort();
    launcher_task.abort();
    0
}

/// Consumes outbound [`orchestrator::ConnectionRequest`]s and drives the
/// platform VPN launcher for each. The launcher's own success/failure is
/// only logged: the FSM has already moved on to `Connected` by the time a
/// request reaches this loop (§4.5's `Connecting` entry action sends the
/// request and posts `connection_established` independent of the
/// launcher's outcome).
async fn drive_launcher(
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<orchestrator::ConnectionRequest>,
) {
    while let Some(request) = outbound.recv().await {
        let connection_id = request.connection_id.clone();
        match launcher::connect(&request).await {
            Ok(()) => log::info!("VPN connection '{connection_id}' established"),
            Err(e) => log::warn!("VPN connection '{connection_id}' failed: {e}"),
        }
    }
}

/// Opens a newly inserted token and feeds the orchestrator's mailbox:
/// `key_inserted` once the card handle is ready, then `key_removed` once
/// the insertion's cancellation scope fires (card pulled, or reader
/// gone).
async fn handle_insertion(
    insertion: InsertionEvent,
    events: EventSender,
    connection_id: String,
    slot_name: String,
) {
    let scope = insertion.scope.clone();
    let reader_id = insertion.reader_id.clone();

    let token = match tokio::task::spawn_blocking(move || insertion.open()).await {
        Ok(Ok(token)) => token,
        Ok(Err(e)) => {
            log::warn!("failed to open token on reader {reader_id}: {e}");
            return;
        }
        Err(e) => {
            log::warn!("token-open task for reader {reader_id} panicked: {e}");
            return;
        }
    };

    events
        .send(OrchEvent::KeyInserted {
            token,
            connection_id,
            slot_name,
        })
        .await;

    scope.cancelled().await;
    events.send(OrchEvent::KeyRemoved).await;
}

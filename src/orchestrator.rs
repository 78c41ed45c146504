//! Connection Orchestrator (C5): the event-driven FSM mediating between
//! the token, the password-entry UI, TOTP computation, and the VPN
//! launcher.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CardError;
use crate::token::Token;
use crate::ui::Ui;

/// A request to establish a VPN connection with a freshly computed code.
/// Consumed exactly once by the launcher adapter.
#[derive(Debug)]
pub struct ConnectionRequest {
    pub connection_id: String,
    pub code: String,
    pub scope: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Hidden,
    Prepare,
    AskPass,
    Connecting,
    Connected,
}

/// Events accepted by the FSM.
pub enum Event {
    KeyInserted {
        token: Arc<dyn Token>,
        connection_id: String,
        slot_name: String,
    },
    KeyRemoved,
    PasswordRequired,
    PasswordNotRequired,
    PasswordEntered(String),
    WrongPassword,
    ConnectionEstablished,
    ConnectionError(String),
    Cancel,
    Done,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::KeyInserted {
                connection_id,
                slot_name,
                ..
            } => f
                .debug_struct("KeyInserted")
                .field("connection_id", connection_id)
                .field("slot_name", slot_name)
                .finish(),
            Event::KeyRemoved => write!(f, "KeyRemoved"),
            Event::PasswordRequired => write!(f, "PasswordRequired"),
            Event::PasswordNotRequired => write!(f, "PasswordNotRequired"),
            Event::PasswordEntered(_) => write!(f, "PasswordEntered(..)"),
            Event::WrongPassword => write!(f, "WrongPassword"),
            Event::ConnectionEstablished => write!(f, "ConnectionEstablished"),
            Event::ConnectionError(msg) => write!(f, "ConnectionError({msg})"),
            Event::Cancel => write!(f, "Cancel"),
            Event::Done => write!(f, "Done"),
        }
    }
}

struct PendingConnection {
    token: Arc<dyn Token>,
    connection_id: String,
    slot_name: String,
}

/// A clonable handle for feeding events into a running [`Controller`].
#[derive(Clone)]
pub struct EventSender(mpsc::Sender<Event>);

impl EventSender {
    pub async fn send(&self, event: Event) {
        let _ = self.0.send(event).await;
    }
}

/// Single-threaded FSM. All transitions run on the task that calls
/// [`Controller::run`]; events enter through a bounded mailbox to
/// guarantee serial, in-order processing. The one operation that
/// genuinely suspends on card I/O (`get_code`) runs on its own spawned
/// task so the mailbox keeps draining — in particular so a `Cancel` sent
/// mid-flight is not stuck behind it.
pub struct Controller<U: Ui> {
    state: State,
    pending: Option<PendingConnection>,
    conn_scope: Option<CancellationToken>,
    events: mpsc::Receiver<Event>,
    sender: mpsc::Sender<Event>,
    outbound: mpsc::UnboundedSender<ConnectionRequest>,
    ui: U,
}

impl<U: Ui> Controller<U> {
    pub fn new(ui: U, outbound: mpsc::UnboundedSender<ConnectionRequest>) -> (Self, EventSender) {
        let (sender, events) = mpsc::channel(32);
        let handle = EventSender(sender.clone());
        (
            Self {
                state: State::Hidden,
                pending: None,
                conn_scope: None,
                events,
                sender,
                outbound,
                ui,
            },
            handle,
        )
    }

    /// Runs the FSM until its event mailbox closes.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.dispatch(event).await;
        }
    }

    fn next_state(from: State, event: &Event) -> Option<State> {
        use Event::*;
        use State::*;
        match (from, event) {
            (Hidden, KeyInserted { .. }) => Some(Prepare),
            (Prepare, PasswordRequired) => Some(AskPass),
            (Prepare, PasswordNotRequired) => Some(Connecting),
            (Prepare, KeyRemoved) => Some(Hidden),
            (AskPass, PasswordEntered(_)) => Some(Connecting),
            (AskPass, KeyRemoved) => Some(Hidden),
            (AskPass, Cancel) => Some(Hidden),
            (Connecting, WrongPassword) => Some(AskPass),
            (Connecting, ConnectionError(_)) => Some(AskPass),
            (Connecting, ConnectionEstablished) => Some(Connected),
            (Connecting, Cancel) => Some(Hidden),
            (Connected, Done) => Some(Hidden),
            _ => None,
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let from = self.state;
        let Some(to) = Self::next_state(from, &event) else {
            log::debug!("dropping event {event:?} in state {from:?}: no transition defined");
            return;
        };

        // Leaving Connecting for Connected hands `conn_scope` off to the
        // launcher (it now owns the connection's lifetime); every other
        // exit from Connecting means the attempt was abandoned, so its
        // scope is cancelled here. This also satisfies the invariant that
        // re-entering Connecting cancels whatever scope a prior, now
        // abandoned, attempt left behind.
        if from == State::Connecting && to != State::Connected {
            if let Some(scope) = self.conn_scope.take() {
                scope.cancel();
            }
        }

        self.state = to;
        self.enter(to, event).await;
    }

    async fn enter(&mut self, state: State, causing_event: Event) {
        match state {
            State::Hidden => {
                self.pending = None;
                self.ui.hide();
            }
            State::Prepare => {
                if let Event::KeyInserted {
                    token,
                    connection_id,
                    slot_name,
                } = causing_event
                {
                    self.pending = Some(PendingConnection {
                        token,
                        connection_id,
                        slot_name,
                    });
                }
                self.sender.send(Event::PasswordRequired).await.ok();
            }
            State::AskPass => {
                let error = match &causing_event {
                    Event::WrongPassword => Some("wrong password".to_string()),
                    Event::ConnectionError(msg) => Some(msg.clone()),
                    _ => None,
                };
                self.ui.show_password_prompt(error.as_deref());
            }
            State::Connecting => {
                self.ui.show_connecting();
                let Some(pending) = self.pending.as_ref() else {
                    self.sender
                        .send(Event::ConnectionError("no pending connection".into()))
                        .await
                        .ok();
                    return;
                };
                let password = match causing_event {
                    Event::PasswordEntered(p) => p,
                    _ => String::new(),
                };

                let scope = CancellationToken::new();
                self.conn_scope = Some(scope.clone());

                let token = pending.token.clone();
                let connection_id = pending.connection_id.clone();
                let slot_name = pending.slot_name.clone();
                let sender = self.sender.clone();
                let outbound = self.outbound.clone();
                let launcher_scope = scope.clone();

                tokio::spawn(async move {
                    tokio::select! {
                        _ = scope.cancelled() => {}
                        result = token.get_code(&password, &slot_name) => {
                            match result {
                                Ok(code) => {
                                    let _ = outbound.send(ConnectionRequest {
                                        connection_id,
                                        code,
                                        scope: launcher_scope,
                                    });
                                    sender.send(Event::ConnectionEstablished).await.ok();
                                }
                                Err(CardError::WrongPassword) => {
                                    sender.send(Event::WrongPassword).await.ok();
                                }
                                Err(other) => {
                                    sender
                                        .send(Event::ConnectionError(other.to_string()))
                                        .await
                                        .ok();
                                }
                            }
                        }
                    }
                });
            }
            State::Connected => {
                self.sender.send(Event::Done).await.ok();
            }
        }
    }
}

//! Idle-timeout forced logout.
//!
//! The monitor is a small state machine running on its own task:
//!
//! ```text
//! Disarmed --(credential present)--> Armed(deadline)
//! Armed --(activity)--> Armed(now + timeout)      cancel, then reschedule
//! Armed --(credential gone)--> Disarmed
//! Armed --(deadline)--> clear store, ForceLogout(idle), Disarmed
//! ```
//!
//! Exactly one deadline exists while armed. A rearm drops the previous sleep
//! before creating the next one.

use std::future::{pending, Future};
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::{debug, info, trace};

use super::credentials::CredentialStore;
use crate::events::{LogoutReason, SessionEvent, SessionEventBus, Subscription};

/// Default inactivity window before a forced logout (15 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// User activity that keeps a session alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    PointerMove,
    KeyPress,
    Click,
    Scroll,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Disarmed,
    Armed { deadline: Instant },
}

impl IdleState {
    pub fn is_armed(&self) -> bool {
        matches!(self, IdleState::Armed { .. })
    }
}

#[derive(Debug)]
enum Command {
    Activity(Activity),
    /// Re-read the store and arm or disarm accordingly.
    Sync,
}

pub struct IdleMonitor {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<IdleState>,
    task: JoinHandle<()>,
    _subscription: Subscription,
}

impl IdleMonitor {
    /// Start monitoring. Must be called from within a tokio runtime.
    pub fn start(store: CredentialStore, bus: SessionEventBus, timeout: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(IdleState::Disarmed);

        let on_change = commands.clone();
        let subscription = bus.subscribe(move |event| {
            if matches!(event, SessionEvent::CredentialChanged) {
                let _ = on_change.send(Command::Sync);
            }
        });

        let _ = commands.send(Command::Sync);
        let task = tokio::spawn(run(store, bus, timeout, rx, state_tx));

        Self {
            commands,
            state,
            task,
            _subscription: subscription,
        }
    }

    /// Report user activity. Ignored while disarmed.
    pub fn record_activity(&self, activity: Activity) {
        let _ = self.commands.send(Command::Activity(activity));
    }

    pub fn state(&self) -> IdleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<IdleState> {
        self.state.clone()
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Deadline {
    at: Instant,
    sleep: Pin<Box<Sleep>>,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        Self {
            at,
            sleep: Box::pin(sleep_until(at)),
        }
    }
}

fn expired(deadline: &mut Option<Deadline>) -> impl Future<Output = ()> + '_ {
    async move {
        match deadline {
            Some(deadline) => deadline.sleep.as_mut().await,
            None => pending().await,
        }
    }
}

async fn run(
    store: CredentialStore,
    bus: SessionEventBus,
    timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<IdleState>,
) {
    let mut deadline: Option<Deadline> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Sync => {
                        let authenticated = store.is_authenticated();
                        if authenticated && deadline.is_none() {
                            debug!(timeout_secs = timeout.as_secs(), "Idle monitor armed");
                            deadline = Some(Deadline::after(timeout));
                        } else if !authenticated && deadline.is_some() {
                            debug!("Idle monitor disarmed");
                            deadline = None;
                        }
                    }
                    Command::Activity(activity) => {
                        if deadline.is_some() {
                            trace!(?activity, "Activity, rearming idle deadline");
                            // Drop the old sleep before scheduling the new one.
                            deadline = None;
                            deadline = Some(Deadline::after(timeout));
                        }
                    }
                }
            }
            () = expired(&mut deadline) => {
                deadline = None;
                state.send_replace(IdleState::Disarmed);
                // A logout whose Sync is still queued already ended the session.
                if !store.is_authenticated() {
                    debug!("Idle deadline reached after logout, disarming");
                    continue;
                }
                store.clear();
                info!(reason = %LogoutReason::Idle, "Session terminated");
                bus.emit(SessionEvent::ForceLogout(LogoutReason::Idle));
                continue;
            }
        }

        state.send_replace(match &deadline {
            Some(deadline) => IdleState::Armed { deadline: deadline.at },
            None => IdleState::Disarmed,
        });
    }
}

//! Connect sequences as a typestate machine.
//!
//! ```text
//! Idle ──start──▶ Dialing ──attempt──▶ Linked
//!   │                ▲   └──────────▶ Backoff ──wait──▶ Dialing
//!   └──hold──▶ Backoff   └──────────▶ Exhausted (Connect mode only)
//! ```
//!
//! A dialer runs in its own task and reports every step back to the session
//! through a channel, tagged with the epoch it was started under. The session
//! aborts the task when it is no longer wanted and ignores reports carrying an
//! old epoch.

use super::config::RetryPolicy;
use super::error::SessionError;
use super::transport::{Connection, Connector};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    /// Host asked to connect: bounded attempts, no initial delay
    Connect,
    /// Link dropped on its own: wait first, then retry forever
    Reconnect,
    /// OS resumed: retry forever, first attempt immediately
    Resume,
}

pub enum DialReport {
    Attempt {
        epoch: u64,
        attempt: u32,
    },
    Failed {
        epoch: u64,
        attempt: u32,
        error: SessionError,
    },
    Linked {
        epoch: u64,
        connection: Connection,
    },
    Exhausted {
        epoch: u64,
        attempts: u32,
    },
}

impl DialReport {
    pub fn epoch(&self) -> u64 {
        match self {
            DialReport::Attempt { epoch, .. }
            | DialReport::Failed { epoch, .. }
            | DialReport::Linked { epoch, .. }
            | DialReport::Exhausted { epoch, .. } => *epoch,
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum DialState {
    Idle,
    Dialing,
    Backoff,
    Linked,
    Exhausted,
}

#[machine]
pub struct Dialer<S: DialState> {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    mode: DialMode,
    epoch: u64,
    attempt: u32,
    reports: mpsc::Sender<DialReport>,
}

pub enum DialStep {
    Linked(Dialer<Linked>),
    Retry(Dialer<Backoff>),
    Exhausted(Dialer<Exhausted>),
    /// The session went away; nobody is listening for reports
    Abandoned,
}

impl<S: DialState> Dialer<S> {
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn mode(&self) -> DialMode {
        self.mode
    }

    async fn report(&self, report: DialReport) -> bool {
        self.reports.send(report).await.is_ok()
    }
}

impl Dialer<Idle> {
    pub fn create(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        mode: DialMode,
        epoch: u64,
        reports: mpsc::Sender<DialReport>,
    ) -> Self {
        debug!("Creating dialer for epoch {} in {:?} mode", epoch, mode);
        Self::new(connector, policy, mode, epoch, 0, reports)
    }

    pub fn start(self) -> Dialer<Dialing> {
        self.transition()
    }

    /// Enter backoff before the first attempt
    pub fn hold(self) -> Dialer<Backoff> {
        self.transition()
    }
}

impl Dialer<Dialing> {
    pub async fn attempt(mut self) -> DialStep {
        self.attempt += 1;
        let attempt = self.attempt;
        let epoch = self.epoch;

        if !self.report(DialReport::Attempt { epoch, attempt }).await {
            return DialStep::Abandoned;
        }

        match self.connector.connect().await {
            Ok(connection) => {
                info!("Connect attempt {} succeeded", attempt);
                if !self.report(DialReport::Linked { epoch, connection }).await {
                    return DialStep::Abandoned;
                }
                DialStep::Linked(self.transition())
            }
            Err(error) => {
                warn!("Connect attempt {} failed: {}", attempt, error);
                if !self.report(DialReport::Failed { epoch, attempt, error }).await {
                    return DialStep::Abandoned;
                }
                if self.mode == DialMode::Connect && attempt >= self.policy.connect_attempts {
                    DialStep::Exhausted(self.transition())
                } else {
                    DialStep::Retry(self.transition())
                }
            }
        }
    }
}

impl Dialer<Backoff> {
    pub fn delay(&self) -> Duration {
        match self.mode {
            DialMode::Connect => self.policy.retry_delay(),
            DialMode::Reconnect | DialMode::Resume => self.policy.reconnect_delay(self.attempt),
        }
    }

    pub async fn wait(self) -> Dialer<Dialing> {
        let delay = self.delay();
        debug!("Waiting {:?} before next connect attempt", delay);
        tokio::time::sleep(delay).await;
        self.transition()
    }
}

impl Dialer<Exhausted> {
    pub async fn give_up(self) {
        warn!("Giving up after {} connect attempts", self.attempt);
        let report = DialReport::Exhausted {
            epoch: self.epoch,
            attempts: self.attempt,
        };
        self.report(report).await;
    }
}

/// Drives a dialer until it is linked, exhausted or abandoned.
pub async fn run(dialer: Dialer<Idle>) {
    let mut dialing = match dialer.mode() {
        DialMode::Reconnect => dialer.hold().wait().await,
        DialMode::Connect | DialMode::Resume => dialer.start(),
    };

    loop {
        match dialing.attempt().await {
            DialStep::Linked(linked) => {
                debug!("Dialer linked after {} attempts", linked.attempts());
                return;
            }
            DialStep::Retry(backoff) => dialing = backoff.wait().await,
            DialStep::Exhausted(exhausted) => {
                exhausted.give_up().await;
                return;
            }
            DialStep::Abandoned => {
                debug!("Session gone, dialer stopping");
                return;
            }
        }
    }
}

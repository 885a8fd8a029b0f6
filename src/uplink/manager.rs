//! Async driver for the uplink state machine.

use super::machine::{Action, FailureOutcome, UplinkMachine, UplinkState};
use super::{UplinkError, UplinkRadio};
use crate::config::UplinkConfig;
use crate::credentials::{CredentialSink, Credentials};
use crate::status::{StatusSink, StatusUpdate};
use crate::supervisor::TaskError;
use log::{debug, error, info, warn};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Keeps the station associated with the provisioned access point.
///
/// Cloning is cheap; all clones drive and observe the same uplink. The radio,
/// the cached credentials and the machine sit behind one mutex that is never
/// held across an `.await`.
pub struct UplinkManager<R: UplinkRadio> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    inner: Mutex<Inner<R>>,
    /// Signalled by credential updates to cut the current wait short.
    wake: Notify,
    status: Arc<dyn StatusSink>,
    config: UplinkConfig,
}

struct Inner<R> {
    radio: R,
    credentials: Credentials,
    machine: UplinkMachine,
}

/// How one association attempt ended.
enum Attempt {
    Associated,
    Failed(FailureOutcome),
    /// Credentials changed mid-attempt; not counted as a failure.
    Superseded,
    Cancelled,
}

impl<R: UplinkRadio> Clone for UplinkManager<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: UplinkRadio + 'static> UplinkManager<R> {
    pub fn new(
        radio: R,
        credentials: Credentials,
        status: Arc<dyn StatusSink>,
        config: UplinkConfig,
    ) -> Self {
        let machine = UplinkMachine::new(config.max_retries, config.exhaustion);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    radio,
                    credentials,
                    machine,
                }),
                wake: Notify::new(),
                status,
                config,
            }),
        }
    }

    /// Run the reconnection loop until cancelled.
    ///
    /// Radio errors are contained here. The loop also returns `Ok(())` when
    /// the retry limit is reached under [`ExhaustionPolicy::Stop`]; after
    /// that, credential updates are still recorded but nothing reconnects.
    ///
    /// [`ExhaustionPolicy::Stop`]: crate::config::ExhaustionPolicy::Stop
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        info!("WiFi reconnection loop started");
        let retry_interval = self.shared.config.retry_interval;

        loop {
            let action = {
                let mut inner = self.lock();
                let configured = !inner.credentials.is_empty();
                let associated = inner.radio.is_connected();
                inner.machine.next_action(configured, associated)
            };

            match action {
                Action::Unconfigured => {
                    warn!("SSID is empty, waiting for credentials");
                    self.publish(false);
                }
                Action::ReportUp => {
                    info!("Associated with {}", self.ssid());
                    self.publish(true);
                }
                Action::Hold => debug!("WiFi link stable"),
                Action::Attempt { link_lost } => {
                    if link_lost {
                        warn!("Association with {} lost", self.ssid());
                        self.publish(false);
                    }
                    match self.attempt(&cancel).await {
                        Attempt::Cancelled => break,
                        Attempt::Associated | Attempt::Superseded => {}
                        Attempt::Failed(FailureOutcome::Retry) => {}
                        Attempt::Failed(FailureOutcome::Exhausted) => {
                            error!(
                                "Exceeded maximum retries ({}), giving up. \
                                 Check the WiFi credentials.",
                                self.shared.config.max_retries
                            );
                            return Ok(());
                        }
                        Attempt::Failed(FailureOutcome::BackOff(wait)) => {
                            warn!(
                                "Exceeded maximum retries, backing off for {:?}",
                                wait
                            );
                            if !self.pause(wait, &cancel).await {
                                break;
                            }
                            self.lock().machine.recover();
                            continue;
                        }
                    }
                }
                Action::Halt => {
                    info!("WiFi retries exhausted, reconnection loop ends");
                    return Ok(());
                }
            }

            if !self.pause(retry_interval, &cancel).await {
                break;
            }
        }

        info!("WiFi task cancelled");
        Ok(())
    }

    /// Replace the cached credentials and restart association.
    ///
    /// Returns immediately; the reconnection happens on the loop's next
    /// cycle. An attempt already in flight is abandoned without counting as
    /// a failure.
    pub fn update_credentials(&self, credentials: Credentials) {
        info!("Updating WiFi credentials (ssid {:?})", credentials.ssid());
        if let Err(e) = credentials.validate() {
            warn!("New credentials look invalid: {}", e);
        }
        {
            let mut inner = self.lock();
            inner.credentials = credentials;
            inner.machine.reset();
            if let Err(e) = inner.radio.disconnect() {
                warn!("WiFi disconnect failed: {}", e);
            }
        }
        self.publish(false);
        self.shared.wake.notify_one();
    }

    /// Drop the current association. The loop reassociates on its next cycle.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut inner = self.lock();
            let was_connected = inner.radio.is_connected();
            if let Err(e) = inner.radio.disconnect() {
                warn!("WiFi disconnect failed: {}", e);
            }
            was_connected
        };
        if was_connected {
            info!("Disconnected from WiFi");
            self.publish(false);
        } else {
            info!("WiFi was not connected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().radio.is_connected()
    }

    /// Station address while associated.
    pub fn address(&self) -> Option<IpAddr> {
        let inner = self.lock();
        if inner.radio.is_connected() {
            inner.radio.ip_addr()
        } else {
            None
        }
    }

    pub fn state(&self) -> UplinkState {
        self.lock().machine.state()
    }

    /// Consecutive failed attempts since the last success or reset.
    pub fn failure_count(&self) -> u32 {
        self.lock().machine.failure_count()
    }

    pub fn credentials(&self) -> Credentials {
        self.lock().credentials.clone()
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Attempt {
        let config = &self.shared.config;

        let generation = {
            let mut inner = self.lock();
            // Start from a clean slate; disconnecting is idempotent.
            if let Err(e) = inner.radio.disconnect() {
                let generation = inner.machine.generation();
                drop(inner);
                return self.failed(generation, Some(e));
            }
            inner.machine.generation()
        };

        tokio::select! {
            _ = cancel.cancelled() => return Attempt::Cancelled,
            _ = tokio::time::sleep(config.settle_delay) => {}
        }

        {
            let mut inner = self.lock();
            if inner.machine.generation() != generation {
                return Attempt::Superseded;
            }
            info!(
                "Attempting to connect to {}",
                inner.credentials.ssid()
            );
            let credentials = inner.credentials.clone();
            if let Err(e) = inner.radio.begin_connect(&credentials) {
                drop(inner);
                return self.failed(generation, Some(e));
            }
        }

        for _ in 0..config.polls_per_attempt() {
            tokio::select! {
                _ = cancel.cancelled() => return Attempt::Cancelled,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }

            let associated = {
                let mut inner = self.lock();
                if inner.machine.generation() != generation {
                    debug!("Credentials changed, abandoning attempt");
                    return Attempt::Superseded;
                }
                let associated = inner.radio.is_connected();
                if associated {
                    inner.machine.attempt_succeeded();
                }
                associated
            };

            if associated {
                match self.address() {
                    Some(ip) => info!("Connected to {}, IP: {}", self.ssid(), ip),
                    None => info!("Connected to {}", self.ssid()),
                }
                self.publish(true);
                return Attempt::Associated;
            }
        }

        self.failed(generation, None)
    }

    /// Count a failed attempt unless the credentials changed underneath it.
    fn failed(&self, generation: u64, error: Option<UplinkError>) -> Attempt {
        let (outcome, count) = {
            let mut inner = self.lock();
            if inner.machine.generation() != generation {
                return Attempt::Superseded;
            }
            let outcome = inner.machine.attempt_failed();
            (outcome, inner.machine.failure_count())
        };

        match error {
            Some(e) => warn!(
                "WiFi radio error: {}. Attempt {}/{}",
                e, count, self.shared.config.max_retries
            ),
            None => warn!(
                "Failed to connect. Attempt {}/{}",
                count, self.shared.config.max_retries
            ),
        }
        self.publish(false);
        Attempt::Failed(outcome)
    }

    /// Wait for `duration`, a credential update, or cancellation.
    ///
    /// Returns `false` if cancelled.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
            _ = self.shared.wake.notified() => {
                debug!("Woken by credential update");
                true
            }
        }
    }

    fn publish(&self, up: bool) {
        self.shared.status.publish(StatusUpdate::new().uplink(up));
    }

    fn ssid(&self) -> String {
        self.lock().credentials.ssid().to_string()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: UplinkRadio + 'static> CredentialSink for UplinkManager<R> {
    fn apply(&self, credentials: Credentials) {
        self.update_credentials(credentials);
    }
}

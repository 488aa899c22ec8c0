//! Connectivity monitor.
//!
//! Producers call [`ConnectivityMonitor::report`] with raw online/offline
//! observations. The debouncer task publishes a transition only once the raw
//! value has held for the debounce window, and emits `Reconnected` on an
//! offline→online edge for the sync loop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{AppEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Reconnected,
    Disconnected,
}

/// Anything that can tell us whether the backend is reachable.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

pub struct ConnectivityMonitor {
    raw_tx: watch::Sender<bool>,
    status_tx: watch::Sender<bool>,
    transitions: broadcast::Sender<ConnectivityEvent>,
    debounce: Duration,
    events: EventBus,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, debounce: Duration, events: EventBus) -> Self {
        let (raw_tx, _) = watch::channel(initially_online);
        let (status_tx, _) = watch::channel(initially_online);
        let (transitions, _) = broadcast::channel(32);
        Self {
            raw_tx,
            status_tx,
            transitions,
            debounce,
            events,
        }
    }

    /// Current debounced status.
    pub fn get_status(&self) -> bool {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.transitions.subscribe()
    }

    /// Feed a raw observation (browser event, probe result, OS callback).
    pub fn report(&self, online: bool) {
        self.raw_tx.send_replace(online);
    }

    fn publish(&self, online: bool) {
        let previous = self.status_tx.send_replace(online);
        if previous == online {
            return;
        }
        let event = if online {
            info!("Network restored");
            ConnectivityEvent::Reconnected
        } else {
            info!("Network offline");
            ConnectivityEvent::Disconnected
        };
        let _ = self.transitions.send(event);
        self.events.emit(AppEvent::ConnectivityChanged { online });
    }

    /// Spawn the debouncer. Runs until `cancel` fires.
    pub fn spawn_debouncer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut raw_rx = self.raw_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = raw_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                // Wait for the raw value to hold steady for a full window.
                let mut candidate = *raw_rx.borrow_and_update();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = tokio::time::timeout(monitor.debounce, raw_rx.changed()) => {
                            match changed {
                                Ok(Ok(())) => {
                                    candidate = *raw_rx.borrow_and_update();
                                    debug!(candidate, "connectivity flickered, restarting debounce window");
                                }
                                Ok(Err(_)) => return,
                                Err(_) => break,
                            }
                        }
                    }
                }
                monitor.publish(candidate);
            }
        })
    }

    /// Spawn a probe that polls `probe` every `interval` and reports the
    /// result. The first check runs immediately.
    pub fn spawn_probe(
        self: &Arc<Self>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!("Connectivity probe started (interval: {}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Connectivity probe stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let online = probe.is_reachable().await;
                        monitor.report(online);
                    }
                }
            }
        })
    }
}

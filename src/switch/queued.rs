//! Reconnection and queueing wrapper
//!
//! Hides transient switch disconnects from callers: rule installs queue
//! while the underlying adapter is down and flush on reconnect. Past
//! `max_queue` entries or `max_disconnect` of downtime the wrapper stops
//! pretending and surfaces `SwitchUnavailable`, at which point the
//! orchestrator fails closed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::FlowTotals;

use super::adapter::{BoxFuture, ObservationCallback, RuleSpec, SwitchControl};

const DEFAULT_MAX_QUEUE: usize = 1000;
const DEFAULT_MAX_DISCONNECT: Duration = Duration::from_secs(60);
/// Every call into the underlying adapter is bounded; a hung switch is
/// treated as a transient disconnect.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn bounded<T>(
    fut: impl std::future::Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    match tokio::time::timeout(IO_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::transient("switch call timed out")),
    }
}

struct QueueState {
    pending: VecDeque<RuleSpec>,
    disconnected_since: Option<Instant>,
}

/// Wrapper around any [`SwitchControl`] adding disconnect tolerance.
pub struct QueuedSwitch {
    inner: Arc<dyn SwitchControl>,
    state: AsyncMutex<QueueState>,
    max_queue: usize,
    max_disconnect: Duration,
}

impl QueuedSwitch {
    pub fn new(inner: Arc<dyn SwitchControl>) -> Self {
        Self::with_limits(inner, DEFAULT_MAX_QUEUE, DEFAULT_MAX_DISCONNECT)
    }

    pub fn with_limits(
        inner: Arc<dyn SwitchControl>,
        max_queue: usize,
        max_disconnect: Duration,
    ) -> Self {
        Self {
            inner,
            state: AsyncMutex::new(QueueState {
                pending: VecDeque::new(),
                disconnected_since: None,
            }),
            max_queue,
            max_disconnect,
        }
    }

    /// True while the wrapper is still masking a disconnect.
    pub async fn is_degraded(&self) -> bool {
        let state = self.state.lock().await;
        state.disconnected_since.is_some()
    }

    /// Push queued installs through the adapter. Returns the number
    /// flushed. Call when the data plane may have recovered.
    pub async fn flush(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut flushed = 0usize;
        while let Some(rule) = state.pending.front().cloned() {
            match bounded(self.inner.install_rule(rule)).await {
                Ok(()) => {
                    state.pending.pop_front();
                    flushed += 1;
                }
                Err(_) => break,
            }
        }
        if state.pending.is_empty() && state.disconnected_since.take().is_some() {
            info!("[SWITCH] Reconnected, {} queued installs flushed", flushed);
        }
        flushed
    }

    fn retryable(err: &CoreError) -> bool {
        matches!(
            err,
            CoreError::SwitchUnavailable | CoreError::Transient { .. }
        )
    }
}

impl SwitchControl for QueuedSwitch {
    fn install_rule<'a>(&'a self, rule: RuleSpec) -> BoxFuture<'a, CoreResult<()>> {
        Box::pin(async move {
            // Drain any backlog first so ordering holds.
            self.flush().await;

            match bounded(self.inner.install_rule(rule.clone())).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    if state.pending.is_empty() {
                        state.disconnected_since = None;
                    }
                    Ok(())
                }
                Err(err) if Self::retryable(&err) => {
                    let mut state = self.state.lock().await;
                    let since = *state.disconnected_since.get_or_insert_with(Instant::now);

                    if since.elapsed() > self.max_disconnect {
                        warn!(
                            "[SWITCH] Disconnected for {:?}, surfacing unavailability",
                            since.elapsed()
                        );
                        return Err(CoreError::SwitchUnavailable);
                    }
                    if state.pending.len() >= self.max_queue {
                        warn!("[SWITCH] Install queue full ({})", self.max_queue);
                        return Err(CoreError::SwitchUnavailable);
                    }

                    state.pending.push_back(rule);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    }

    fn remove_rule<'a>(&'a self, rule_id: &'a str) -> BoxFuture<'a, CoreResult<()>> {
        Box::pin(async move {
            self.flush().await;
            // A removal for a still-queued install cancels it locally.
            {
                let mut state = self.state.lock().await;
                state.pending.retain(|r| r.rule_id != rule_id);
            }
            bounded(self.inner.remove_rule(rule_id)).await
        })
    }

    fn list_rules<'a>(&'a self) -> BoxFuture<'a, CoreResult<Vec<RuleSpec>>> {
        Box::pin(async move { bounded(self.inner.list_rules()).await })
    }

    fn get_flow_stats<'a>(&'a self) -> BoxFuture<'a, CoreResult<Vec<FlowTotals>>> {
        Box::pin(async move { bounded(self.inner.get_flow_stats()).await })
    }

    fn record_observation(&self, callback: ObservationCallback) {
        self.inner.record_observation(callback);
    }
}

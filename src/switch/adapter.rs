//! Switch control interface
//!
//! Decisions leave the core as abstract forwarding rules; an adapter
//! translates them for the switch it fronts. Devices are identified by
//! MAC here — the switch has no notion of device ids.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::models::{FlowTotals, PacketObservation, RuleMatch};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked per observed packet while observation recording is on.
pub type ObservationCallback = Arc<dyn Fn(PacketObservation) + Send + Sync>;

/// Forwarding action installed on a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Normal forwarding.
    Forward,
    /// Drop matching traffic.
    Drop,
    /// Send matching traffic out a fixed port (honeypot or quarantine).
    Output(u32),
    /// Forward but log matches.
    Monitor,
}

/// One abstract forwarding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub rule_id: String,
    pub matches: RuleMatch,
    pub action: RuleAction,
    pub priority: u16,
}

/// Interface to one or more programmable switches.
///
/// Errors: `Transient` asks the caller to retry, `SwitchRuleRejected` is
/// permanent for that rule, `SwitchUnavailable` means the data plane is
/// gone and callers must fail closed.
pub trait SwitchControl: Send + Sync {
    fn install_rule<'a>(&'a self, rule: RuleSpec) -> BoxFuture<'a, CoreResult<()>>;

    fn remove_rule<'a>(&'a self, rule_id: &'a str) -> BoxFuture<'a, CoreResult<()>>;

    fn list_rules<'a>(&'a self) -> BoxFuture<'a, CoreResult<Vec<RuleSpec>>>;

    /// Aggregated per-device counters since the previous call.
    fn get_flow_stats<'a>(&'a self) -> BoxFuture<'a, CoreResult<Vec<FlowTotals>>>;

    /// Register a packet-observation callback used during profiling.
    fn record_observation(&self, callback: ObservationCallback);
}

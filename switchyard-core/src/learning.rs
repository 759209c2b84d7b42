//! Per-switch MAC learning table.

use dashmap::DashMap;
use std::collections::HashMap;

use crate::domain::addr::{Dpid, MacAddr, PortNo};

/// Maps `dpid -> (MAC -> ingress port)`.
///
/// Each switch gets its own shard, so sessions for different switches can learn
/// concurrently. Entries are overwritten on every frame and never expire.
#[derive(Debug, Default)]
pub struct MacLearningTable {
    switches: DashMap<Dpid, HashMap<MacAddr, PortNo>>,
}

impl MacLearningTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `mac` was last seen on `port` of switch `dpid`.
    ///
    /// Returns the port previously recorded for the address, if any.
    pub fn learn(&self, dpid: Dpid, mac: MacAddr, port: PortNo) -> Option<PortNo> {
        self.switches.entry(dpid).or_default().insert(mac, port)
    }

    /// The port `mac` was last seen on, if it has been seen on this switch.
    pub fn lookup(&self, dpid: Dpid, mac: MacAddr) -> Option<PortNo> {
        self.switches.get(&dpid)?.get(&mac).copied()
    }

    /// Number of addresses learned on `dpid`.
    pub fn len(&self, dpid: Dpid) -> usize {
        self.switches.get(&dpid).map_or(0, |table| table.len())
    }

    /// Whether nothing has been learned on `dpid`.
    pub fn is_empty(&self, dpid: Dpid) -> bool {
        self.len(dpid) == 0
    }

    /// Switches that have at least one learned address.
    pub fn switches(&self) -> Vec<Dpid> {
        self.switches.iter().map(|entry| *entry.key()).collect()
    }
}

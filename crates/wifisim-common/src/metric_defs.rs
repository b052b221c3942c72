//! Definitions of every metric emitted by wifisim.
//!
//! Entities emit through the `metrics` facade using the `name` of these
//! definitions; the runner lists them with `wifisim metrics`.

use std::fmt;

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        })
    }
}

/// Unit of a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    None,
    Count,
    Bytes,
    Microseconds,
    Decibels,
    DecibelMilliwatts,
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: MetricUnit,
    pub description: &'static str,
    /// Labels emitted in addition to the node labels.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::None => "",
            MetricUnit::Count => "count",
            MetricUnit::Bytes => "bytes",
            MetricUnit::Microseconds => "us",
            MetricUnit::Decibels => "dB",
            MetricUnit::DecibelMilliwatts => "dBm",
        }
    }
}

// ============================================================================
// PHY
// ============================================================================

pub const PHY_TX_PPDUS: MetricDef = MetricDef {
    name: "wifisim.phy.tx_ppdus",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "PPDUs transmitted",
    labels: &["preamble"],
};

pub const PHY_TX_AIRTIME: MetricDef = MetricDef {
    name: "wifisim.phy.tx_airtime",
    kind: MetricKind::Counter,
    unit: MetricUnit::Microseconds,
    description: "Time spent transmitting",
    labels: &["preamble"],
};

pub const PHY_TX_REJECTED: MetricDef = MetricDef {
    name: "wifisim.phy.tx_rejected",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Transmission requests refused because of the PHY state",
    labels: &["state"],
};

pub const PHY_RX_OK: MetricDef = MetricDef {
    name: "wifisim.phy.rx_ok",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "PSDUs received with at least one correct MPDU",
    labels: &["preamble"],
};

pub const PHY_RX_ERROR: MetricDef = MetricDef {
    name: "wifisim.phy.rx_error",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "PSDUs received with every MPDU in error",
    labels: &["preamble"],
};

pub const PHY_RX_DROP: MetricDef = MetricDef {
    name: "wifisim.phy.rx_drop",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "PPDUs dropped before payload reception",
    labels: &["reason"],
};

pub const PHY_RX_SNR: MetricDef = MetricDef {
    name: "wifisim.phy.rx_snr",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Decibels,
    description: "Payload SINR of received PSDUs",
    labels: &[],
};

pub const PHY_RX_POWER: MetricDef = MetricDef {
    name: "wifisim.phy.rx_power",
    kind: MetricKind::Histogram,
    unit: MetricUnit::DecibelMilliwatts,
    description: "Received power of PPDUs entering reception",
    labels: &[],
};

pub const PHY_STATE_CHANGES: MetricDef = MetricDef {
    name: "wifisim.phy.state_changes",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "PHY state transitions, by entered state",
    labels: &["state"],
};

pub const PHY_STATE_TIME: MetricDef = MetricDef {
    name: "wifisim.phy.state_time",
    kind: MetricKind::Counter,
    unit: MetricUnit::Microseconds,
    description: "Time spent per PHY state",
    labels: &["state"],
};

// ============================================================================
// Medium
// ============================================================================

pub const MEDIUM_DELIVERIES: MetricDef = MetricDef {
    name: "wifisim.medium.deliveries",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "PPDU copies delivered to receiving PHYs",
    labels: &[],
};

// ============================================================================
// Agents
// ============================================================================

pub const PING_TX: MetricDef = MetricDef {
    name: "wifisim.ping.tx",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Echo requests handed to the PHY",
    labels: &[],
};

pub const PING_RX: MetricDef = MetricDef {
    name: "wifisim.ping.rx",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Echo replies received before the stop time",
    labels: &[],
};

pub const PING_RTT: MetricDef = MetricDef {
    name: "wifisim.ping.rtt",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Microseconds,
    description: "Echo round-trip time",
    labels: &[],
};

pub const ECHO_REPLIES: MetricDef = MetricDef {
    name: "wifisim.echo.replies",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Echo replies sent",
    labels: &[],
};

pub const TRIGGER_SENT: MetricDef = MetricDef {
    name: "wifisim.trigger.sent",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Trigger frames soliciting HE TB PPDUs",
    labels: &[],
};

pub const TB_RESPONSES: MetricDef = MetricDef {
    name: "wifisim.trigger.tb_responses",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "HE TB PPDUs sent in response to a trigger",
    labels: &[],
};

pub const TB_RECEIVED: MetricDef = MetricDef {
    name: "wifisim.trigger.tb_received",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "HE TB PSDUs received by the triggering AP",
    labels: &[],
};

pub const DL_MU_SENT: MetricDef = MetricDef {
    name: "wifisim.dl_mu.sent",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "HE MU PPDUs sent",
    labels: &[],
};

pub const DL_MU_RECEIVED: MetricDef = MetricDef {
    name: "wifisim.dl_mu.received",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "HE MU PSDUs received by stations",
    labels: &[],
};

// ============================================================================
// Simulation
// ============================================================================

pub const SIMULATION_EVENTS: MetricDef = MetricDef {
    name: "wifisim.sim.events",
    kind: MetricKind::Counter,
    unit: MetricUnit::Count,
    description: "Events dispatched by the event loop",
    labels: &["kind"],
};

/// Every metric, in listing order.
pub const ALL: &[MetricDef] = &[
    PHY_TX_PPDUS,
    PHY_TX_AIRTIME,
    PHY_TX_REJECTED,
    PHY_RX_OK,
    PHY_RX_ERROR,
    PHY_RX_DROP,
    PHY_RX_SNR,
    PHY_RX_POWER,
    PHY_STATE_CHANGES,
    PHY_STATE_TIME,
    MEDIUM_DELIVERIES,
    PING_TX,
    PING_RX,
    PING_RTT,
    ECHO_REPLIES,
    TRIGGER_SENT,
    TB_RESPONSES,
    TB_RECEIVED,
    DL_MU_SENT,
    DL_MU_RECEIVED,
    SIMULATION_EVENTS,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for def in ALL {
            assert!(def.name.starts_with("wifisim."), "{}", def.name);
            assert!(seen.insert(def.name), "duplicate {}", def.name);
        }
    }
}

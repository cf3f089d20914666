//! Same-host liveness probes between panels

use convoy_protocol::LivenessKind;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LivenessCounters {
    pub pings_sent: u32,
    pub acks: u32,
    pub nacks: u32,
}

pub struct LivenessChannel {
    instance_id: String,
    counters: LivenessCounters,
}

impl LivenessChannel {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            counters: LivenessCounters::default(),
        }
    }

    pub fn counters(&self) -> LivenessCounters {
        self.counters
    }

    /// Outgoing probe. Returns the `(kind, from)` pair to broadcast.
    pub fn ping(&mut self) -> (LivenessKind, String) {
        self.counters.pings_sent += 1;
        (LivenessKind::Ping, self.instance_id.clone())
    }

    /// Handle a probe from a panel; a ping is answered with an ack.
    pub fn receive(&mut self, kind: LivenessKind, from: &str) -> Option<(LivenessKind, String)> {
        match kind {
            LivenessKind::Ping => {
                debug!(
                    component = "liveness",
                    event = "liveness.ping",
                    from = %from,
                    "Answering liveness ping"
                );
                Some((LivenessKind::Ack, self.instance_id.clone()))
            }
            LivenessKind::Ack => {
                self.counters.acks += 1;
                info!(
                    component = "liveness",
                    event = "liveness.ack",
                    from = %from,
                    acks = self.counters.acks,
                    "Liveness ack"
                );
                None
            }
            LivenessKind::Nack => {
                self.counters.nacks += 1;
                info!(
                    component = "liveness",
                    event = "liveness.nack",
                    from = %from,
                    nacks = self.counters.nacks,
                    "Liveness nack"
                );
                None
            }
        }
    }
}

use http::StatusCode;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use crate::tunnel::Tunnel;

/// Outcome of inspecting the origin response head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Relay the response like any other; the gate has no further role.
    Passthrough,
    /// The origin granted a protocol switch; hand both sockets to the
    /// tunnel once the head has gone out.
    Switch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GateState {
    AwaitingHead,
    Passthrough,
    Switched,
    Done,
}

/// Per-cycle state machine deciding between a normal response relay and a
/// tunnel handoff.
pub(crate) struct SwitchGate {
    state: GateState,
}

impl SwitchGate {
    pub(crate) fn new() -> Self {
        Self {
            state: GateState::AwaitingHead,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> GateState {
        self.state
    }

    /// Observe the origin response status, once per cycle.
    pub(crate) fn observe(&mut self, status: StatusCode) -> Verdict {
        debug_assert_eq!(self.state, GateState::AwaitingHead);
        if status == StatusCode::SWITCHING_PROTOCOLS {
            self.state = GateState::Switched;
            Verdict::Switch
        } else {
            self.state = GateState::Passthrough;
            Verdict::Passthrough
        }
    }

    /// Export both raw sockets and schedule the tunnel.
    ///
    /// The upgrades resolve only after the 101 head has been written to
    /// the client, so the in-flight response completes before ownership
    /// of either socket moves. The client connection is detached from
    /// server-side lifecycle management by the upgrade itself.
    pub(crate) fn handoff(&mut self, client: OnUpgrade, origin: OnUpgrade) {
        debug_assert_eq!(self.state, GateState::Switched);
        self.state = GateState::Done;
        tokio::spawn(async move {
            let (client, origin) = match tokio::join!(client, origin) {
                (Ok(client), Ok(origin)) => (client, origin),
                (client, origin) => {
                    if let Err(e) = client {
                        tracing::debug!(error = %e, "client upgrade failed");
                    }
                    if let Err(e) = origin {
                        tracing::debug!(error = %e, "origin upgrade failed");
                    }
                    return;
                }
            };
            let (up, down) = Tunnel::new(TokioIo::new(client), TokioIo::new(origin))
                .run()
                .await;
            tracing::debug!(bytes_up = up, bytes_down = down, "tunnel closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_switch_status_detaches_gate() {
        let mut gate = SwitchGate::new();
        assert_eq!(gate.observe(StatusCode::OK), Verdict::Passthrough);
        assert_eq!(gate.state(), GateState::Passthrough);
    }

    #[test]
    fn switching_protocols_arms_handoff() {
        let mut gate = SwitchGate::new();
        assert_eq!(
            gate.observe(StatusCode::SWITCHING_PROTOCOLS),
            Verdict::Switch
        );
        assert_eq!(gate.state(), GateState::Switched);
    }
}

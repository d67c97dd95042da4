//! Stop and destroy flows.
//!
//! Safe from any state: a VM that is not running is not stopped again,
//! only the helper daemons are. Destroy always asks the driver to remove
//! backend state, which it tolerates being absent.

use super::{Effect, Event, Flow, LifecycleState};
use crate::error::Stage;

pub struct StopFlow {
    pub destroy: bool,
}

impl Flow for StopFlow {
    fn name(&self) -> &'static str {
        if self.destroy { "destroy" } else { "stop" }
    }

    fn stage(&self) -> Stage {
        Stage::Stop
    }

    fn transition(&self, state: LifecycleState, event: &Event) -> (LifecycleState, Vec<Effect>) {
        use LifecycleState::*;
        match (state, event) {
            (_, Event::FlowStarted) => (Stopping, vec![Effect::ProbeVm]),

            (Stopping, Event::VmProbed { .. }) if self.destroy => {
                (Stopping, vec![Effect::DestroyVm])
            }
            (Stopping, Event::VmProbed { running: true }) => (Stopping, vec![Effect::StopVm]),
            (Stopping, Event::VmProbed { running: false }) => {
                (Stopping, vec![Effect::StopDaemons])
            }

            (Stopping, Event::VmStopped) => (Stopping, vec![Effect::StopDaemons]),
            (Stopping, Event::DaemonsStopped) => (Stopped, vec![]),

            (_, Event::Failed(_)) => (Failed, vec![]),

            _ => {
                tracing::warn!(?state, ?event, "stop flow ignored event");
                (state, vec![])
            }
        }
    }
}

//! Start flow: probe, fetch, boot, provision.
//!
//! A VM that is already running skips straight to provisioning, so
//! re-running start after a failed provision neither re-fetches nor
//! reboots.

use super::{Effect, Event, Flow, LifecycleState};
use crate::error::Stage;

pub struct StartFlow {
    /// Run provisioning after boot. Off for `start --no-provision`.
    pub provision: bool,
}

impl StartFlow {
    fn after_boot(&self) -> (LifecycleState, Vec<Effect>) {
        if self.provision {
            (LifecycleState::Provisioning, vec![Effect::Provision])
        } else {
            (LifecycleState::Running, vec![])
        }
    }
}

impl Flow for StartFlow {
    fn name(&self) -> &'static str {
        "start"
    }

    fn stage(&self) -> Stage {
        Stage::Start
    }

    fn transition(&self, state: LifecycleState, event: &Event) -> (LifecycleState, Vec<Effect>) {
        use LifecycleState::*;
        match (state, event) {
            (Idle, Event::FlowStarted) => (Idle, vec![Effect::ProbeVm]),

            (Idle, Event::VmProbed { running: true }) => self.after_boot(),
            (Idle, Event::VmProbed { running: false }) => {
                (FetchingResources, vec![Effect::FetchAssets])
            }

            (FetchingResources, Event::AssetsReady) => (StartingVm, vec![Effect::StartVm]),
            (StartingVm, Event::VmStarted) => self.after_boot(),
            (Provisioning, Event::Provisioned) => (Running, vec![]),

            (_, Event::Failed(_)) => (Failed, vec![]),

            _ => {
                tracing::warn!(?state, ?event, "start flow ignored event");
                (state, vec![])
            }
        }
    }
}

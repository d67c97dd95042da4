//! Provision flow: re-apply the deployment to a VM that is already up.

use super::{Effect, Event, Flow, LifecycleState};
use crate::error::Stage;

pub struct ProvisionFlow;

impl Flow for ProvisionFlow {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn stage(&self) -> Stage {
        Stage::Provision
    }

    fn transition(&self, state: LifecycleState, event: &Event) -> (LifecycleState, Vec<Effect>) {
        use LifecycleState::*;
        match (state, event) {
            (Idle, Event::FlowStarted) => (Idle, vec![Effect::RequireRunningVm]),
            (Idle, Event::VmProbed { running: true }) => (Provisioning, vec![Effect::Provision]),
            (Provisioning, Event::Provisioned) => (Running, vec![]),
            (_, Event::Failed(_)) => (Failed, vec![]),
            _ => (state, vec![]),
        }
    }
}

//! Drives a [`Flow`] to a terminal state.
//!
//! Effects become async workers in a `FuturesUnordered`; each worker's
//! completion event is fed back into the flow's transition function. Flows
//! only ever emit one effect at a time, so steps run strictly in order.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;

use super::{Effect, Event, Flow, Lifecycle, LifecycleState};
use crate::driver::VmConfig;
use crate::error::CfdevError;
use crate::observer::{ObserverProgress, Transition};

type Worker<'a> = Pin<Box<dyn Future<Output = (Effect, Result<Event, CfdevError>)> + Send + 'a>>;

/// Run `flow` from `Idle`. Returns the terminal state on success, or the
/// error of the step that moved the flow to `Failed`.
pub(super) async fn run_flow(
    lc: &Lifecycle,
    flow: &dyn Flow,
    vm: Option<&VmConfig>,
) -> Result<LifecycleState, CfdevError> {
    let mut state = LifecycleState::Idle;
    let mut entered = Instant::now();
    let mut failure: Option<CfdevError> = None;
    let mut workers: FuturesUnordered<Worker<'_>> = FuturesUnordered::new();
    let mut next_event = Some(Event::FlowStarted);

    lc.set_current(state, flow.stage());
    tracing::debug!(flow = flow.name(), "flow started");

    loop {
        let event = match next_event.take() {
            Some(event) => event,
            None => match workers.next().await {
                Some((_, Ok(event))) => event,
                Some((effect, Err(e))) => {
                    let stage = effect.stage(flow.stage());
                    tracing::error!(flow = flow.name(), ?effect, error = %e, "step failed");
                    failure.get_or_insert(e);
                    Event::Failed(stage)
                }
                None => break,
            },
        };

        let (new_state, effects) = flow.transition(state, &event);
        tracing::debug!(flow = flow.name(), ?event, from = %state, to = %new_state, "transition");

        if new_state != state {
            let elapsed = entered.elapsed();
            lc.observer.on_transition(&Transition {
                flow: flow.name(),
                from: state,
                to: new_state,
                elapsed,
            });
            lc.record_transition(flow.name(), state, new_state, elapsed)
                .await;
            state = new_state;
            entered = Instant::now();
            lc.set_current(state, flow.stage());
        }

        for effect in effects {
            workers.push(make_worker(lc, effect, vm));
        }

        if state.is_terminal() {
            break;
        }
    }

    match state {
        LifecycleState::Failed => Err(failure.unwrap_or(CfdevError::Validation {
            message: format!("{} flow failed", flow.name()),
        })),
        LifecycleState::Running | LifecycleState::Stopped => Ok(state),
        stuck => Err(CfdevError::Validation {
            message: format!("{} flow stalled while {stuck}", flow.name()),
        }),
    }
}

fn work<'a, F>(effect: Effect, fut: F) -> Worker<'a>
where
    F: Future<Output = Result<Event, CfdevError>> + Send + 'a,
{
    Box::pin(async move { (effect, fut.await) })
}

/// Map an effect to the worker that performs it.
fn make_worker<'a>(lc: &'a Lifecycle, effect: Effect, vm: Option<&'a VmConfig>) -> Worker<'a> {
    match effect {
        Effect::ProbeVm => work(effect, async move {
            let running = lc.driver.is_running().await?;
            Ok(Event::VmProbed { running })
        }),
        Effect::RequireRunningVm => work(effect, async move {
            if lc.driver.is_running().await? {
                Ok(Event::VmProbed { running: true })
            } else {
                Err(CfdevError::VmNotRunning)
            }
        }),
        Effect::FetchAssets => work(effect, async move {
            let progress = ObserverProgress(lc.observer.as_ref());
            lc.cache.sync(&lc.assets, &progress).await?;
            Ok(Event::AssetsReady)
        }),
        Effect::StartVm => work(effect, async move {
            let vm = vm.ok_or_else(|| CfdevError::Validation {
                message: "no VM configuration for start".into(),
            })?;
            lc.driver.setup_networking().await?;
            lc.driver.start(vm).await?;
            Ok(Event::VmStarted)
        }),
        Effect::Provision => work(effect, async move {
            let deployment = lc.deployment()?;
            let address = &lc.sys_config.config.vm.address;
            lc.provisioner
                .wait_until_ready(address, lc.sys_config.provision_ready_timeout())
                .await?;
            match deployment {
                Some(deployment) => lc.provisioner.deploy(address, &deployment).await?,
                None => tracing::info!("no deployment configured, controller is ready"),
            }
            Ok(Event::Provisioned)
        }),
        Effect::StopVm => work(effect, async move {
            lc.driver.stop().await?;
            Ok(Event::VmStopped)
        }),
        Effect::DestroyVm => work(effect, async move {
            lc.driver.destroy().await?;
            Ok(Event::VmStopped)
        }),
        Effect::StopDaemons => work(effect, async move {
            lc.driver.teardown_networking().await?;
            for label in lc.helper_labels() {
                lc.daemons.stop(label).await?;
            }
            Ok(Event::DaemonsStopped)
        }),
    }
}

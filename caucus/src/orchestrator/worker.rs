//! The cycle worker: executes enqueued generation cycles.
//!
//! The state machine's critical section only enqueues a [`CycleRequest`];
//! this worker drains the queue, runs the long external calls with the
//! retry policy, and re-enters the machine solely to commit or record the
//! failure. One worker serves all deliberations — cycles for different
//! deliberations are rare, long, and already serialized per deliberation by
//! the enqueue protocol.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::deliberation::machine::{CycleRequest, DeliberationMachine};
use crate::events::{DeliberationEvent, SharedEventBus};

use super::cycle::Orchestrator;
use super::retry::RetryPolicy;

/// Consumes [`CycleRequest`]s and drives the orchestrator.
pub struct CycleWorker {
    machine: Arc<DeliberationMachine>,
    orchestrator: Orchestrator,
    events: SharedEventBus,
    rx: mpsc::UnboundedReceiver<CycleRequest>,
    policy: RetryPolicy,
}

impl CycleWorker {
    pub fn new(
        machine: Arc<DeliberationMachine>,
        orchestrator: Orchestrator,
        events: SharedEventBus,
        rx: mpsc::UnboundedReceiver<CycleRequest>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            machine,
            orchestrator,
            events,
            rx,
            policy,
        }
    }

    /// Spawn the worker loop onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            self.handle(request).await;
        }
        info!("cycle worker stopped");
    }

    async fn handle(&self, request: CycleRequest) {
        self.events.publish(DeliberationEvent::CycleStarted {
            deliberation_id: request.deliberation_id.clone(),
            round: request.round,
            trigger: request.trigger,
            timestamp: Utc::now(),
        });

        let deliberation = match self.machine.get_deliberation(&request.deliberation_id).await {
            Ok(deliberation) => deliberation,
            Err(e) => {
                error!(
                    deliberation_id = %request.deliberation_id,
                    "dropping cycle for unloadable deliberation: {}",
                    e
                );
                return;
            }
        };

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match self.orchestrator.run_cycle(&deliberation, &request).await {
                Ok(output) => break Ok(output),
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) if !self.policy.allows_retry(attempts) => break Err(e),
                Err(e) => {
                    let delay = self.policy.delay(attempts - 1);
                    warn!(
                        deliberation_id = %request.deliberation_id,
                        round = request.round,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "cycle attempt failed, backing off: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match result {
            Ok(output) => {
                if let Err(e) = self
                    .machine
                    .commit_cycle(&request, output.candidates, output.record)
                    .await
                {
                    error!(
                        deliberation_id = %request.deliberation_id,
                        round = request.round,
                        "cycle commit failed: {}",
                        e
                    );
                    self.machine
                        .fail_cycle(&request, e.to_string(), attempts, false)
                        .await;
                }
            }
            Err(e) => {
                let retriable = !e.is_fatal();
                self.machine
                    .fail_cycle(&request, e.to_string(), attempts, retriable)
                    .await;
            }
        }
    }
}

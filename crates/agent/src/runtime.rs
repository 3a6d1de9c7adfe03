//! Assembles the runtime from configuration.
//!
//! One `EpisodeRuntime` is shared by every episode of a host process: the
//! tool pipeline, kill switch, event bus and checkpoint store are built
//! once, and each episode gets its own state machine and budget guard.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tether_config::AppConfig;
use tether_core::audit::AuditEmitter;
use tether_core::checkpoint::CheckpointStore;
use tether_core::episode::Episode;
use tether_core::error::CheckpointError;
use tether_core::event::EventBus;
use tether_core::policy::PolicyEngine;
use tether_core::tool::ToolRegistry;
use tether_security::KillSwitch;
use tether_telemetry::{BudgetFloor, TraceRecorder};
use tether_tools::ToolWrapper;

use crate::checkpoint::open_checkpoint_store;
use crate::machine::EpisodeMachine;
use crate::recursion::RecursionController;

pub struct EpisodeRuntime {
    config: AppConfig,
    wrapper: Arc<ToolWrapper>,
    kill_switch: Arc<KillSwitch>,
    events: Arc<EventBus>,
    recorder: Arc<TraceRecorder>,
    store: Arc<dyn CheckpointStore>,
}

impl std::fmt::Debug for EpisodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeRuntime")
            .field("tools", &self.wrapper.registry().len())
            .field("handlers", &self.wrapper.handler_ids().len())
            .field("kill_switch_engaged", &self.kill_switch.is_engaged())
            .finish()
    }
}

impl EpisodeRuntime {
    /// Build the runtime. The registry is frozen from here on; handlers
    /// are registered on [`wrapper`](Self::wrapper).
    pub fn new(
        config: AppConfig,
        registry: ToolRegistry,
        policy: Arc<dyn PolicyEngine>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        let recorder = Arc::new(TraceRecorder::new());
        let wrapper = ToolWrapper::new(Arc::new(registry), policy, audit)
            .with_default_timeout_ms(config.runtime.default_tool_timeout_ms)
            .with_max_concurrent_per_client(config.runtime.max_concurrent_tools_per_client)
            .with_recorder(recorder.clone());
        let kill_switch = Arc::new(
            KillSwitch::with_flag_file(config.estop_path())
                .with_poll_interval(Duration::from_millis(config.kill_switch.poll_interval_ms)),
        );
        let store = open_checkpoint_store(&config);

        info!(
            tools = wrapper.registry().len(),
            timeout_ms = config.runtime.default_tool_timeout_ms,
            max_concurrent = config.runtime.max_concurrent_tools_per_client,
            "Episode runtime ready"
        );

        Self {
            config,
            wrapper: Arc::new(wrapper),
            kill_switch,
            events: Arc::new(EventBus::default()),
            recorder,
            store,
        }
    }

    pub fn with_kill_switch(mut self, kill_switch: Arc<KillSwitch>) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn wrapper(&self) -> &Arc<ToolWrapper> {
        &self.wrapper
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.kill_switch
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn recorder(&self) -> &Arc<TraceRecorder> {
        &self.recorder
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// A root episode with the configured default budget and recursion
    /// policy, in `pending`.
    pub fn create_episode(
        &self,
        client_id: impl Into<String>,
        agent_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Arc<EpisodeMachine> {
        let episode = Episode::new(client_id, agent_id, goal, self.config.budget.to_budget())
            .with_recursion_policy(self.config.recursion.to_policy());
        self.machine_for(episode)
    }

    /// Wrap a caller-built episode with this runtime's collaborators.
    pub fn machine_for(&self, episode: Episode) -> Arc<EpisodeMachine> {
        self.recorder.start_trace(episode.id.as_str());
        Arc::new(self.configure(EpisodeMachine::new(
            episode,
            self.wrapper.clone(),
            self.kill_switch.clone(),
        )))
    }

    /// Recursion controller for a root episode.
    pub fn controller(&self, root: Arc<EpisodeMachine>) -> RecursionController {
        RecursionController::new(root)
            .with_default_fraction(self.config.recursion.default_child_fraction)
    }

    /// Resume an episode from a stored checkpoint.
    pub async fn resume(&self, checkpoint_id: &str) -> Result<Arc<EpisodeMachine>, CheckpointError> {
        let checkpoint = self.store.load(checkpoint_id).await?;
        let machine =
            EpisodeMachine::resume(&checkpoint, self.wrapper.clone(), self.kill_switch.clone())?;
        self.recorder.start_trace(machine.id().as_str());
        Ok(Arc::new(self.configure(machine)))
    }

    fn configure(&self, machine: EpisodeMachine) -> EpisodeMachine {
        let floor = self.config.budget_floor;
        machine
            .with_phase_requirements(self.config.phases.clone())
            .with_events(self.events.clone())
            .with_advisory_threshold(self.config.runtime.advisory_threshold)
            .with_budget_floor(BudgetFloor {
                tokens: floor.tokens,
                time_ms: floor.time_ms,
                tool_calls: floor.tool_calls,
            })
    }
}

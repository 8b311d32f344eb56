use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::RachioClient;
use crate::config::Config;
use crate::dispatch::CommandDispatcher;
use crate::governor::RateGovernor;
use crate::logger::MessageLogMode;
use crate::state::{ChangeCallback, ControllerSnapshot, DeviceStateModel};
use crate::sync::PollSynchronizer;
use crate::types::*;
use crate::webhook::WebhookReceiver;
use crate::{Error, Result};

type FaultCallback = Box<dyn Fn(&Fault) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PollState {
    Ready,
    Backoff { until: Instant },
    /// Token rejected; not polled again until the token is replaced.
    Halted,
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryEntry {
    pub units: UnitSystem,
    pub active: bool,
    pub poll: PollState,
    pub failures: u32,
}

#[derive(Default)]
pub(crate) struct ControllerRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl ControllerRegistry {
    /// The unit system is fixed by the first registration.
    pub fn register(&self, controller_id: &str, units: UnitSystem) {
        self.entries
            .entry(controller_id.to_string())
            .or_insert(RegistryEntry {
                units,
                active: true,
                poll: PollState::Ready,
                failures: 0,
            });
    }

    pub fn deregister(&self, controller_id: &str) -> bool {
        self.entries.remove(controller_id).is_some()
    }

    pub fn set_active(&self, controller_id: &str, active: bool) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(controller_id)
            .ok_or_else(|| Error::UnknownTarget(controller_id.to_string()))?;
        entry.active = active;
        Ok(())
    }

    pub fn get(&self, controller_id: &str) -> Option<RegistryEntry> {
        self.entries.get(controller_id).map(|e| e.value().clone())
    }

    pub fn due(&self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !entry.active {
                continue;
            }
            match entry.poll {
                PollState::Ready => due.push(entry.key().clone()),
                PollState::Backoff { until } if now >= until => {
                    entry.poll = PollState::Ready;
                    due.push(entry.key().clone());
                }
                PollState::Backoff { .. } | PollState::Halted => {}
            }
        }
        due.sort();
        due
    }

    pub fn halt(&self, controller_id: &str) {
        if let Some(mut e) = self.entries.get_mut(controller_id) {
            e.poll = PollState::Halted;
        }
    }

    pub fn back_off(&self, controller_id: &str, until: Instant) {
        if let Some(mut e) = self.entries.get_mut(controller_id) {
            e.poll = PollState::Backoff { until };
        }
    }

    /// Returns the number of consecutive failures including this one.
    pub fn record_failure(&self, controller_id: &str) -> u32 {
        match self.entries.get_mut(controller_id) {
            Some(mut e) => {
                e.failures += 1;
                e.failures
            }
            None => 0,
        }
    }

    /// Returns the failure streak that just ended.
    pub fn record_success(&self, controller_id: &str) -> u32 {
        match self.entries.get_mut(controller_id) {
            Some(mut e) => {
                e.poll = PollState::Ready;
                std::mem::take(&mut e.failures)
            }
            None => 0,
        }
    }

    pub fn resume_halted(&self) -> usize {
        let mut resumed = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.poll == PollState::Halted {
                entry.poll = PollState::Ready;
                entry.failures = 0;
                resumed += 1;
            }
        }
        resumed
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

pub(crate) struct Context {
    pub config: Config,
    pub client: RachioClient,
    pub governor: RateGovernor,
    pub model: Arc<DeviceStateModel>,
    pub registry: ControllerRegistry,
    fault_callbacks: Vec<FaultCallback>,
}

impl Context {
    pub fn report(&self, fault: Fault) {
        debug!(?fault, "fault");
        for cb in &self.fault_callbacks {
            cb(&fault);
        }
    }
}

pub struct SyncEngineBuilder {
    config: Config,
    change_callbacks: Vec<ChangeCallback>,
    fault_callbacks: Vec<FaultCallback>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl SyncEngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            change_callbacks: Vec::new(),
            fault_callbacks: Vec::new(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn on_change(mut self, f: impl Fn(&StateChange) + Send + Sync + 'static) -> Self {
        self.change_callbacks.push(Box::new(f));
        self
    }

    pub fn on_fault(mut self, f: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
        self.fault_callbacks.push(Box::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        let config = self.config;
        if config.rate_budget == 0 {
            return Err(Error::Config("rate budget must be positive".to_string()));
        }
        if config.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }

        let mut client = RachioClient::builder(config.access_token.clone())
            .base_url(config.api_url.clone())
            .timeout(config.request_timeout);
        if let (Some(mode), Some(path)) = (self.log_mode, self.log_path) {
            client = client.message_log(mode, path);
        }
        let client = client.build()?;

        let model = DeviceStateModel::new(config.poll_interval, config.poll_interval)
            .with_callbacks(self.change_callbacks);

        let ctx = Arc::new(Context {
            governor: RateGovernor::new(config.rate_budget, config.rate_window),
            client,
            model: Arc::new(model),
            registry: ControllerRegistry::default(),
            fault_callbacks: self.fault_callbacks,
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(SyncEngine {
            synchronizer: PollSynchronizer::new(ctx.clone(), shutdown_rx.clone()),
            webhooks: Arc::new(WebhookReceiver::new(ctx.clone())),
            dispatcher: CommandDispatcher::new(ctx.clone()),
            ctx,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(JoinSet::new()),
            poller_started: Mutex::new(false),
        })
    }
}

/// Nothing runs until [`SyncEngine::spawn_poller`] or
/// [`SyncEngine::serve_webhooks`] is called.
pub struct SyncEngine {
    ctx: Arc<Context>,
    synchronizer: PollSynchronizer,
    webhooks: Arc<WebhookReceiver>,
    dispatcher: CommandDispatcher,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<JoinSet<()>>,
    poller_started: Mutex<bool>,
}

impl SyncEngine {
    pub fn builder(config: Config) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn client(&self) -> &RachioClient {
        &self.ctx.client
    }

    pub fn model(&self) -> &Arc<DeviceStateModel> {
        &self.ctx.model
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn webhooks(&self) -> &Arc<WebhookReceiver> {
        &self.webhooks
    }

    /// A controller keeps the unit system it was first registered with.
    pub fn register_controller(&self, controller_id: &str, units: UnitSystem) {
        if let Some(existing) = self.ctx.model.units(controller_id)
            && existing != units
        {
            warn!(
                controller = %controller_id,
                units = existing.as_api_param(),
                requested = units.as_api_param(),
                "controller already registered, keeping its unit system"
            );
            return;
        }
        info!(controller = %controller_id, units = units.as_api_param(), "registering controller");
        self.ctx.registry.register(controller_id, units);
        self.ctx.model.register(controller_id, units);
    }

    pub fn deregister_controller(&self, controller_id: &str) -> bool {
        info!(controller = %controller_id, "deregistering controller");
        let known = self.ctx.registry.deregister(controller_id);
        self.ctx.model.deregister(controller_id) || known
    }

    pub fn set_active(&self, controller_id: &str, active: bool) -> Result<()> {
        self.ctx.registry.set_active(controller_id, active)
    }

    pub fn set_active_controllers(&self, active: &[&str]) {
        for id in self.ctx.registry.ids() {
            let _ = self.ctx.registry.set_active(&id, active.contains(&id.as_str()));
        }
    }

    pub fn snapshot(&self, controller_id: &str) -> Option<ControllerSnapshot> {
        self.ctx.model.snapshot(controller_id)
    }

    pub async fn remaining_budget(&self) -> u32 {
        self.ctx.governor.remaining().await
    }

    /// Replaces the token and resumes controllers halted by an auth failure.
    pub fn update_access_token(&self, token: impl Into<String>) {
        self.ctx.client.set_access_token(SecretString::from(token.into()));
        let resumed = self.ctx.registry.resume_halted();
        if resumed > 0 {
            info!(resumed, "resuming controllers after token update");
        }
    }

    pub async fn discover_controllers(&self) -> Result<Vec<ControllerSummary>> {
        self.ctx.governor.reserve(2).await?;
        let person_id = self.ctx.client.get_person_id().await.inspect_err(|e| {
            self.ctx.report(Fault::CommError {
                controller_id: None,
                call: ApiCall::PersonInfo,
                message: e.to_string(),
            })
        })?;
        let all = self
            .ctx
            .client
            .list_controllers_for(&person_id)
            .await
            .inspect_err(|e| {
                self.ctx.report(Fault::CommError {
                    controller_id: None,
                    call: ApiCall::Person,
                    message: e.to_string(),
                })
            })?;
        Ok(all
            .into_iter()
            .filter(|c| !self.ctx.model.contains(&c.id))
            .collect())
    }

    pub async fn poll_cycle(&self) {
        self.synchronizer.poll_cycle().await;
    }

    pub async fn poll_now(&self, controller_id: &str) -> Result<()> {
        self.synchronizer.poll_now(controller_id).await
    }

    pub fn spawn_poller(&self) {
        let mut started = self.poller_started.lock();
        if *started {
            return;
        }
        *started = true;
        let synchronizer = self.synchronizer.clone();
        self.tasks.lock().spawn(async move { synchronizer.run().await });
    }

    pub fn serve_webhooks(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let (bound, server) = self.webhooks.clone().bind(addr, self.shutdown_rx.clone())?;
        let mut tasks = self.tasks.lock();
        if let Some(worker) = self.webhooks.take_worker(self.shutdown_rx.clone()) {
            tasks.spawn(worker);
        }
        tasks.spawn(server);
        info!(addr = %bound, "webhook endpoint listening");
        Ok(bound)
    }

    /// Starts the queue worker without an HTTP listener, for hosts that
    /// deliver webhook bodies themselves via [`WebhookReceiver::receive`].
    pub fn spawn_webhook_worker(&self) {
        if let Some(worker) = self.webhooks.take_worker(self.shutdown_rx.clone()) {
            self.tasks.lock().spawn(worker);
        }
    }

    pub async fn shutdown(self) {
        info!("shutting down sync engine");
        let _ = self.shutdown_tx.send(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!("engine task ended abnormally: {e}");
            }
        }
    }
}

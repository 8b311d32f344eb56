use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::diff::diff_attributes;
use crate::engine::{Context, PollState};
use crate::protocol::title_case;
use crate::types::*;
use crate::{Error, Result};

/// Governor units reserved per controller per cycle: controller info,
/// current run, weather, and a possible schedule-rule lookup.
pub const POLL_COST: u32 = 4;

pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[derive(Clone)]
pub struct PollSynchronizer {
    ctx: Arc<Context>,
    shutdown: watch::Receiver<bool>,
}

impl PollSynchronizer {
    pub(crate) fn new(ctx: Arc<Context>, shutdown: watch::Receiver<bool>) -> Self {
        Self { ctx, shutdown }
    }

    /// A cycle in progress is always finished before returning.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.ctx.config.poll_interval.as_secs(), "poll loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            self.poll_cycle().await;
            if *shutdown.borrow() {
                break;
            }
        }
        info!("poll loop stopped");
    }

    pub async fn poll_cycle(&self) {
        let due = self.ctx.registry.due(Instant::now());
        debug!(controllers = due.len(), "poll cycle");

        let mut set = JoinSet::new();
        for controller_id in due {
            let this = self.clone();
            set.spawn(async move {
                // Errors are already logged and reported as faults.
                let _ = this.poll_controller(&controller_id).await;
            });
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!("poll task panicked: {e}");
            }
        }
    }

    /// Immediate refresh of one controller, honoring an active rate-limit
    /// backoff or a rejected token.
    pub async fn poll_now(&self, controller_id: &str) -> Result<()> {
        let entry = self
            .ctx
            .registry
            .get(controller_id)
            .ok_or_else(|| Error::UnknownTarget(controller_id.to_string()))?;
        let now = Instant::now();
        match entry.poll {
            PollState::Halted => {
                debug!(controller = %controller_id, "refresh refused, access token was rejected");
                return Err(Error::Auth(401));
            }
            PollState::Backoff { until } if until > now => {
                return Err(Error::RateLimited {
                    retry_after: Some(until - now),
                });
            }
            _ => {}
        }
        self.poll_controller(controller_id).await
    }

    pub(crate) async fn poll_controller(&self, controller_id: &str) -> Result<()> {
        let units = self
            .ctx
            .registry
            .get(controller_id)
            .map(|e| e.units)
            .ok_or_else(|| Error::UnknownTarget(controller_id.to_string()))?;

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            reserved = self.ctx.governor.reserve(POLL_COST) => reserved?,
            _ = stopped(&mut shutdown) => {
                debug!(controller = %controller_id, "shutdown while waiting for rate budget");
                return Ok(());
            }
        }

        match self.sync_controller(controller_id, units).await {
            Ok(()) => {
                let streak = self.ctx.registry.record_success(controller_id);
                if streak > 0 {
                    info!(controller = %controller_id, failures = streak, "controller reachable again");
                }
                Ok(())
            }
            Err((call, e)) => {
                self.handle_failure(controller_id, call, &e);
                Err(e)
            }
        }
    }

    async fn sync_controller(
        &self,
        controller_id: &str,
        units: UnitSystem,
    ) -> std::result::Result<(), (ApiCall, Error)> {
        let client = &self.ctx.client;

        let info = client
            .get_controller_info(controller_id, units)
            .await
            .map_err(|e| (ApiCall::ControllerInfo, e))?;
        let run = client
            .get_current_schedule(controller_id)
            .await
            .map_err(|e| (ApiCall::CurrentSchedule, e))?;
        let run_attrs = self
            .run_attributes(&info.schedules, run)
            .await
            .map_err(|e| (ApiCall::CurrentSchedule, e))?;

        let mut incoming = info.controller.attributes();
        incoming.extend(run_attrs);
        incoming.extend(info.schedules.iter().map(|s| {
            (
                Attribute::SeasonalAdjustment(s.id.clone()),
                s.seasonal_adjustment
                    .map_or(StateValue::Unavailable, |p| StateValue::Int(p as i64)),
            )
        }));
        self.ctx
            .model
            .set_reference_data(controller_id, info.zones, info.schedules);
        self.apply(controller_id, incoming, Utc::now());

        // A rejected forecast leaves the previous one untouched.
        let weather = client
            .get_weather(controller_id, units)
            .await
            .map_err(|e| (ApiCall::Forecast, e))?;
        let mut incoming = weather.current.attributes();
        incoming.extend(weather.forecast.attributes());
        let now = Utc::now();
        self.apply(controller_id, incoming, now);
        self.ctx.model.mark_synced(controller_id, now);
        Ok(())
    }

    async fn run_attributes(
        &self,
        schedules: &[Schedule],
        run: CurrentRun,
    ) -> Result<Vec<(Attribute, StateValue)>> {
        let (schedule, zone) = match run {
            CurrentRun::Idle => (NO_ACTIVE_SCHEDULE.to_string(), 0),
            CurrentRun::Running {
                run_type,
                schedule_rule_id,
                zone_number,
            } => {
                let name = match schedule_rule_id {
                    Some(rule_id) if run_type == "AUTOMATIC" => {
                        match schedules.iter().find(|s| s.id == rule_id) {
                            Some(s) => s.name.clone(),
                            None => self.ctx.client.get_schedule_rule(&rule_id).await?.name,
                        }
                    }
                    _ => title_case(&run_type),
                };
                (name, zone_number.unwrap_or(0))
            }
        };
        Ok(vec![
            (Attribute::Device(DeviceField::ActiveSchedule), StateValue::Text(schedule)),
            (Attribute::Device(DeviceField::ActiveZone), StateValue::Int(zone as i64)),
        ])
    }

    fn apply(&self, controller_id: &str, incoming: Vec<(Attribute, StateValue)>, at: DateTime<Utc>) {
        let Some(snapshot) = self.ctx.model.snapshot(controller_id) else {
            debug!(controller = %controller_id, "controller deregistered during poll");
            return;
        };
        // Values that confirm a pending command must reach the model even
        // though the optimistic update already holds them.
        let confirming: Vec<(Attribute, StateValue)> = incoming
            .iter()
            .filter(|(attr, value)| {
                snapshot
                    .pending
                    .iter()
                    .any(|p| &p.attribute == attr && &p.expected == value)
            })
            .cloned()
            .collect();
        let mut updates = diff_attributes(&snapshot.attributes, incoming);
        for (attr, value) in confirming {
            if !updates.iter().any(|(a, _)| a == &attr) {
                updates.push((attr, value));
            }
        }
        if updates.is_empty() {
            return;
        }
        match self
            .ctx
            .model
            .apply_batch(controller_id, updates, UpdateSource::Poll, at)
        {
            Ok(applied) => debug!(controller = %controller_id, changes = applied.len(), "poll applied"),
            Err(e) => debug!(controller = %controller_id, "poll result dropped: {e}"),
        }
    }

    fn handle_failure(&self, controller_id: &str, call: ApiCall, e: &Error) {
        let ctx = &self.ctx;
        match e {
            Error::Auth(status) => {
                error!(controller = %controller_id, status, "access token rejected, polling halted");
                ctx.registry.halt(controller_id);
                self.mark_offline(controller_id);
                ctx.report(Fault::CommError {
                    controller_id: Some(controller_id.to_string()),
                    call,
                    message: e.to_string(),
                });
            }
            Error::RateLimited { retry_after } => {
                let wait = retry_after.unwrap_or(ctx.config.rate_limit_backoff);
                warn!(controller = %controller_id, wait_secs = wait.as_secs(), "rate limited by remote service");
                ctx.registry.back_off(controller_id, Instant::now() + wait);
                ctx.report(Fault::RateLimitExceeded {
                    controller_id: Some(controller_id.to_string()),
                    retry_after: wait,
                });
            }
            _ => {
                let failures = ctx.registry.record_failure(controller_id);
                if failures == 1 {
                    error!(controller = %controller_id, ?call, "poll failed, will continue to retry silently: {e}");
                } else {
                    debug!(controller = %controller_id, ?call, failures, "poll failed: {e}");
                }
                ctx.report(Fault::CommError {
                    controller_id: Some(controller_id.to_string()),
                    call,
                    message: e.to_string(),
                });
                if failures == ctx.config.offline_after_failures {
                    warn!(controller = %controller_id, failures, "controller unreachable, marking offline");
                    self.mark_offline(controller_id);
                    ctx.report(Fault::ControllerOffline {
                        controller_id: controller_id.to_string(),
                    });
                }
            }
        }
    }

    fn mark_offline(&self, controller_id: &str) {
        let _ = self.ctx.model.apply_update(
            controller_id,
            Attribute::Device(DeviceField::Status),
            StateValue::Text(ConnectivityStatus::Offline.as_api_str().to_string()),
            UpdateSource::Local,
            Utc::now(),
        );
    }
}

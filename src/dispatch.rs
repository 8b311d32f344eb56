use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::Context;
use crate::protocol::MAX_ZONE_RUNTIME_SECS;
use crate::types::*;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSelector {
    Id(String),
    Named { controller_id: String, name: String },
}

impl ScheduleSelector {
    pub fn id(schedule_id: impl Into<String>) -> Self {
        ScheduleSelector::Id(schedule_id.into())
    }

    pub fn named(controller_id: impl Into<String>, name: impl Into<String>) -> Self {
        ScheduleSelector::Named {
            controller_id: controller_id.into(),
            name: name.into(),
        }
    }
}

/// Commands are validated against cached reference data before any request
/// is made.
pub struct CommandDispatcher {
    ctx: Arc<Context>,
}

impl CommandDispatcher {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub async fn run_schedule(&self, selector: &ScheduleSelector) -> Result<()> {
        let (controller_id, schedule) = self.resolve_schedule(selector)?;
        if !schedule.runnable {
            return Err(Error::NotRunnable(format!(
                "schedule {:?} cannot be started manually",
                schedule.name
            )));
        }
        self.execute(
            &controller_id,
            ActionKind::RunSchedule {
                schedule_id: schedule.id.clone(),
            },
            Attribute::Device(DeviceField::ActiveSchedule),
            StateValue::Text(schedule.name),
        )
        .await
    }

    /// `percent` must lie in [-100, 100].
    pub async fn set_seasonal_adjustment(
        &self,
        selector: &ScheduleSelector,
        percent: i32,
    ) -> Result<()> {
        if !(-100..=100).contains(&percent) {
            return Err(Error::InvalidParameter(format!(
                "seasonal adjustment {percent}% outside -100..=100"
            )));
        }
        let (controller_id, schedule) = self.resolve_schedule(selector)?;
        self.execute(
            &controller_id,
            ActionKind::SetSeasonalAdjustment {
                schedule_id: schedule.id.clone(),
                percent,
            },
            Attribute::SeasonalAdjustment(schedule.id),
            StateValue::Int(percent as i64),
        )
        .await
    }

    pub async fn set_standby_mode(&self, controller_id: &str, enabled: bool) -> Result<()> {
        self.require_registered(controller_id)?;
        self.execute(
            controller_id,
            ActionKind::SetStandbyMode { enabled },
            Attribute::Device(DeviceField::InStandbyMode),
            StateValue::Bool(enabled),
        )
        .await
    }

    /// Starts a single zone. The duration is clamped to the zone's maximum
    /// runtime and to the service limit; the value sent is returned.
    pub async fn start_zone(
        &self,
        controller_id: &str,
        zone_number: u32,
        duration: Duration,
    ) -> Result<u32> {
        let snapshot = self
            .ctx
            .model
            .snapshot(controller_id)
            .ok_or_else(|| Error::UnknownTarget(controller_id.to_string()))?;
        let zone = snapshot.zone(zone_number).ok_or_else(|| {
            Error::UnknownTarget(format!("zone {zone_number} on controller {controller_id}"))
        })?;
        if !zone.enabled {
            return Err(Error::NotRunnable(format!("zone {zone_number} is disabled")));
        }
        if duration.is_zero() {
            return Err(Error::InvalidParameter("zone duration must be positive".to_string()));
        }

        let mut secs = duration.as_secs().min(MAX_ZONE_RUNTIME_SECS as u64) as u32;
        if zone.max_runtime > 0 {
            secs = secs.min(zone.max_runtime);
        }
        secs = secs.max(1);

        self.execute(
            controller_id,
            ActionKind::StartZone {
                zone_id: zone.id.clone(),
                zone_number,
                duration_secs: secs,
            },
            Attribute::Device(DeviceField::ActiveZone),
            StateValue::Int(zone_number as i64),
        )
        .await?;
        Ok(secs)
    }

    pub async fn stop_watering(&self, controller_id: &str) -> Result<()> {
        self.require_registered(controller_id)?;
        self.execute(
            controller_id,
            ActionKind::StopWatering,
            Attribute::Device(DeviceField::ActiveZone),
            StateValue::Int(0),
        )
        .await
    }

    fn require_registered(&self, controller_id: &str) -> Result<()> {
        if self.ctx.model.contains(controller_id) {
            Ok(())
        } else {
            Err(Error::UnknownTarget(controller_id.to_string()))
        }
    }

    fn resolve_schedule(&self, selector: &ScheduleSelector) -> Result<(String, Schedule)> {
        match selector {
            ScheduleSelector::Id(id) => self
                .ctx
                .model
                .find_schedule(id)
                .ok_or_else(|| Error::UnknownTarget(format!("schedule {id}"))),
            ScheduleSelector::Named {
                controller_id,
                name,
            } => {
                let snapshot = self
                    .ctx
                    .model
                    .snapshot(controller_id)
                    .ok_or_else(|| Error::UnknownTarget(controller_id.clone()))?;
                let schedule = snapshot.schedule_by_name(name).cloned().ok_or_else(|| {
                    Error::UnknownTarget(format!("schedule {name:?} on controller {controller_id}"))
                })?;
                Ok((controller_id.clone(), schedule))
            }
        }
    }

    async fn execute(
        &self,
        controller_id: &str,
        action: ActionKind,
        attribute: Attribute,
        expected: StateValue,
    ) -> Result<()> {
        let ctx = &self.ctx;
        // The guard is only registered once the request can actually go out.
        if let Err(e) = ctx.governor.reserve(1).await {
            return Err(self.failed(controller_id, None, &action, e));
        }
        let id = ctx.model.submit_command(
            controller_id,
            action.clone(),
            attribute.clone(),
            expected.clone(),
        )?;
        info!(controller = %controller_id, command = %id, action = action.name(), "sending command");

        match self.send(controller_id, &action).await {
            Ok(()) => {
                let _ = ctx.model.apply_update(
                    controller_id,
                    attribute,
                    expected,
                    UpdateSource::Command,
                    Utc::now(),
                );
                ctx.model.acknowledge_command(controller_id, id);
                Ok(())
            }
            Err(e) => Err(self.failed(controller_id, Some(id), &action, e)),
        }
    }

    fn failed(
        &self,
        controller_id: &str,
        id: Option<uuid::Uuid>,
        action: &ActionKind,
        e: Error,
    ) -> Error {
        let ctx = &self.ctx;
        if let Some(id) = id {
            ctx.model.fail_command(controller_id, id);
        }
        warn!(controller = %controller_id, action = action.name(), "command failed: {e}");
        if let Error::RateLimited { retry_after } = e {
            ctx.report(Fault::RateLimitExceeded {
                controller_id: Some(controller_id.to_string()),
                retry_after: retry_after.unwrap_or(ctx.config.rate_limit_backoff),
            });
        }
        ctx.report(Fault::CommandFailed {
            controller_id: controller_id.to_string(),
            action: action.clone(),
            message: e.to_string(),
        });
        e
    }

    async fn send(&self, controller_id: &str, action: &ActionKind) -> Result<()> {
        let client = &self.ctx.client;
        match action {
            ActionKind::RunSchedule { schedule_id } => client.run_schedule(schedule_id).await,
            ActionKind::SetSeasonalAdjustment {
                schedule_id,
                percent,
            } => client.set_seasonal_adjustment(schedule_id, *percent).await,
            ActionKind::SetStandbyMode { enabled } => {
                client.set_standby_mode(controller_id, *enabled).await
            }
            ActionKind::StartZone {
                zone_id,
                duration_secs,
                ..
            } => client.start_zone(zone_id, *duration_secs).await,
            ActionKind::StopWatering => client.stop_watering(controller_id).await,
        }
    }
}

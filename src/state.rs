use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::*;
use crate::{Error, Result};

pub(crate) type ChangeCallback = Box<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    value: StateValue,
    source: UpdateSource,
    timestamp: DateTime<Utc>,
}

struct ControllerState {
    units: UnitSystem,
    attributes: BTreeMap<Attribute, Entry>,
    dirty: BTreeSet<Attribute>,
    zones: Vec<Zone>,
    schedules: Vec<Schedule>,
    pending: Vec<PendingCommand>,
    last_sync: Option<DateTime<Utc>>,
}

impl ControllerState {
    fn new(units: UnitSystem) -> Self {
        Self {
            units,
            attributes: BTreeMap::new(),
            dirty: BTreeSet::new(),
            zones: Vec::new(),
            schedules: Vec::new(),
            pending: Vec::new(),
            last_sync: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub controller_id: String,
    pub unit_system: UnitSystem,
    pub attributes: BTreeMap<Attribute, StateValue>,
    pub zones: Vec<Zone>,
    pub schedules: Vec<Schedule>,
    pub pending: Vec<PendingCommand>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl ControllerSnapshot {
    pub fn get(&self, attribute: &Attribute) -> Option<&StateValue> {
        self.attributes.get(attribute)
    }

    pub fn device(&self, field: DeviceField) -> Option<&StateValue> {
        self.attributes.get(&Attribute::Device(field))
    }

    pub fn in_standby_mode(&self) -> Option<bool> {
        self.device(DeviceField::InStandbyMode).and_then(StateValue::as_bool)
    }

    pub fn status(&self) -> Option<ConnectivityStatus> {
        self.device(DeviceField::Status)
            .and_then(StateValue::as_str)
            .and_then(ConnectivityStatus::from_api_str)
    }

    pub fn active_zone(&self) -> Option<i64> {
        self.device(DeviceField::ActiveZone).and_then(StateValue::as_int)
    }

    pub fn active_schedule(&self) -> Option<&str> {
        self.device(DeviceField::ActiveSchedule).and_then(StateValue::as_str)
    }

    pub fn seasonal_adjustment(&self, schedule_id: &str) -> Option<i64> {
        self.attributes
            .get(&Attribute::SeasonalAdjustment(schedule_id.to_string()))
            .and_then(StateValue::as_int)
    }

    pub fn forecast(&self, day: u8, field: WeatherField) -> Option<&StateValue> {
        self.attributes.get(&Attribute::Forecast { day, field })
    }

    pub fn schedule(&self, schedule_id: &str) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.id == schedule_id)
    }

    pub fn schedule_by_name(&self, name: &str) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.name == name)
    }

    pub fn zone(&self, zone_number: u32) -> Option<&Zone> {
        self.zones.iter().find(|z| z.zone_number == zone_number)
    }
}

/// Change callbacks run after the controller's lock is released.
pub struct DeviceStateModel {
    controllers: DashMap<String, Arc<Mutex<ControllerState>>>,
    precedence_window: TimeDelta,
    settle_window: TimeDelta,
    callbacks: Vec<ChangeCallback>,
}

impl DeviceStateModel {
    pub fn new(precedence_window: Duration, settle_window: Duration) -> Self {
        Self {
            controllers: DashMap::new(),
            precedence_window: TimeDelta::from_std(precedence_window).unwrap_or(TimeDelta::MAX),
            settle_window: TimeDelta::from_std(settle_window).unwrap_or(TimeDelta::MAX),
            callbacks: Vec::new(),
        }
    }

    pub fn on_change(&mut self, f: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(f));
    }

    pub(crate) fn with_callbacks(mut self, callbacks: Vec<ChangeCallback>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    /// Registering an already known controller keeps its state and units.
    pub fn register(&self, controller_id: &str, units: UnitSystem) {
        self.controllers
            .entry(controller_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ControllerState::new(units))));
    }

    pub fn deregister(&self, controller_id: &str) -> bool {
        self.controllers.remove(controller_id).is_some()
    }

    pub fn contains(&self, controller_id: &str) -> bool {
        self.controllers.contains_key(controller_id)
    }

    pub fn controller_ids(&self) -> Vec<String> {
        self.controllers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn units(&self, controller_id: &str) -> Option<UnitSystem> {
        self.slot(controller_id).map(|s| s.lock().units)
    }

    pub fn apply_update(
        &self,
        controller_id: &str,
        attribute: Attribute,
        value: StateValue,
        source: UpdateSource,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let changes =
            self.apply_batch(controller_id, vec![(attribute, value)], source, timestamp)?;
        Ok(!changes.is_empty())
    }

    pub fn apply_batch(
        &self,
        controller_id: &str,
        updates: Vec<(Attribute, StateValue)>,
        source: UpdateSource,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<StateChange>> {
        let slot = self
            .slot(controller_id)
            .ok_or_else(|| Error::UnknownTarget(controller_id.to_string()))?;

        let changes = {
            let mut state = slot.lock();
            self.expire_pending(&mut state, controller_id, timestamp);

            let mut changes = Vec::new();
            for (attribute, value) in updates {
                if let Some(change) =
                    self.apply_one(&mut state, controller_id, attribute, value, source, timestamp)
                {
                    changes.push(change);
                }
            }
            changes
        };

        for change in &changes {
            for cb in &self.callbacks {
                cb(change);
            }
        }
        Ok(changes)
    }

    fn apply_one(
        &self,
        state: &mut ControllerState,
        controller_id: &str,
        attribute: Attribute,
        value: StateValue,
        source: UpdateSource,
        timestamp: DateTime<Utc>,
    ) -> Option<StateChange> {
        if source == UpdateSource::Poll
            && let Some(pos) = state.pending.iter().position(|p| p.attribute == attribute)
        {
            if state.pending[pos].expected == value {
                let confirmed = state.pending.remove(pos);
                debug!(controller = %controller_id, command = %confirmed.id, attribute = %attribute, "command confirmed by poll");
            } else {
                trace!(controller = %controller_id, attribute = %attribute, "poll value suppressed by pending command");
                return None;
            }
        }

        if let Some(existing) = state.attributes.get(&attribute)
            && !self.supersedes(existing, source, timestamp)
        {
            trace!(controller = %controller_id, attribute = %attribute, ?source, "stale update ignored");
            return None;
        }

        let old = state.attributes.insert(
            attribute.clone(),
            Entry {
                value: value.clone(),
                source,
                timestamp,
            },
        );
        let old = old.map(|e| e.value);
        if old.as_ref() == Some(&value) {
            return None;
        }

        state.dirty.insert(attribute.clone());
        Some(StateChange {
            controller_id: controller_id.to_string(),
            attribute,
            old,
            new: value,
            source,
            timestamp,
        })
    }

    /// Latest timestamp wins and ties go to the newcomer, except that a
    /// webhook value beats a poll value within one precedence window of it.
    fn supersedes(&self, existing: &Entry, source: UpdateSource, timestamp: DateTime<Utc>) -> bool {
        use UpdateSource::{Poll, Webhook};
        match (existing.source, source) {
            (Webhook, Poll) => timestamp > existing.timestamp + self.precedence_window,
            (Poll, Webhook) => timestamp + self.precedence_window >= existing.timestamp,
            _ => timestamp >= existing.timestamp,
        }
    }

    fn expire_pending(&self, state: &mut ControllerState, controller_id: &str, now: DateTime<Utc>) {
        let settle = self.settle_window;
        state.pending.retain(|p| {
            let live = now <= p.submitted_at + settle;
            if !live {
                debug!(controller = %controller_id, command = %p.id, "pending command settled");
            }
            live
        });
    }

    pub fn snapshot(&self, controller_id: &str) -> Option<ControllerSnapshot> {
        let slot = self.slot(controller_id)?;
        let state = slot.lock();
        Some(ControllerSnapshot {
            controller_id: controller_id.to_string(),
            unit_system: state.units,
            attributes: state
                .attributes
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
            zones: state.zones.clone(),
            schedules: state.schedules.clone(),
            pending: state.pending.clone(),
            last_sync: state.last_sync,
        })
    }

    pub fn take_dirty(&self, controller_id: &str) -> Vec<Attribute> {
        match self.slot(controller_id) {
            Some(slot) => std::mem::take(&mut slot.lock().dirty).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn set_reference_data(&self, controller_id: &str, zones: Vec<Zone>, schedules: Vec<Schedule>) {
        if let Some(slot) = self.slot(controller_id) {
            let mut state = slot.lock();
            state.zones = zones;
            state.schedules = schedules;
        }
    }

    pub(crate) fn mark_synced(&self, controller_id: &str, at: DateTime<Utc>) {
        if let Some(slot) = self.slot(controller_id) {
            slot.lock().last_sync = Some(at);
        }
    }

    pub fn find_schedule(&self, schedule_id: &str) -> Option<(String, Schedule)> {
        let slots: Vec<(String, Arc<Mutex<ControllerState>>)> = self
            .controllers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        slots.into_iter().find_map(|(id, slot)| {
            let state = slot.lock();
            state
                .schedules
                .iter()
                .find(|s| s.id == schedule_id)
                .cloned()
                .map(|s| (id, s))
        })
    }

    pub(crate) fn submit_command(
        &self,
        controller_id: &str,
        action: ActionKind,
        attribute: Attribute,
        expected: StateValue,
    ) -> Result<Uuid> {
        let slot = self
            .slot(controller_id)
            .ok_or_else(|| Error::UnknownTarget(controller_id.to_string()))?;
        let id = Uuid::new_v4();
        let mut state = slot.lock();
        // A newer command on the same attribute replaces the older guard.
        state.pending.retain(|p| p.attribute != attribute);
        state.pending.push(PendingCommand {
            id,
            controller_id: controller_id.to_string(),
            action,
            attribute,
            expected,
            submitted_at: Utc::now(),
            state: CommandState::Submitted,
        });
        Ok(id)
    }

    pub(crate) fn acknowledge_command(&self, controller_id: &str, id: Uuid) {
        if let Some(slot) = self.slot(controller_id)
            && let Some(cmd) = slot.lock().pending.iter_mut().find(|p| p.id == id)
        {
            cmd.state = CommandState::Acknowledged;
        }
    }

    pub(crate) fn fail_command(&self, controller_id: &str, id: Uuid) -> Option<PendingCommand> {
        let slot = self.slot(controller_id)?;
        let mut state = slot.lock();
        let pos = state.pending.iter().position(|p| p.id == id)?;
        let mut cmd = state.pending.remove(pos);
        cmd.state = CommandState::Failed;
        Some(cmd)
    }

    pub fn pending_commands(&self, controller_id: &str) -> Vec<PendingCommand> {
        self.slot(controller_id)
            .map(|s| s.lock().pending.clone())
            .unwrap_or_default()
    }

    fn slot(&self, controller_id: &str) -> Option<Arc<Mutex<ControllerState>>> {
        self.controllers.get(controller_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const WINDOW: Duration = Duration::from_secs(180);

    fn model() -> DeviceStateModel {
        let m = DeviceStateModel::new(WINDOW, WINDOW);
        m.register("c1", UnitSystem::Imperial);
        m
    }

    fn zone_attr() -> Attribute {
        Attribute::Device(DeviceField::ActiveZone)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn apply_records_change_and_dirty() {
        let m = model();
        assert!(m
            .apply_update("c1", zone_attr(), StateValue::Int(2), UpdateSource::Poll, at(0))
            .unwrap());
        assert!(!m
            .apply_update("c1", zone_attr(), StateValue::Int(2), UpdateSource::Poll, at(10))
            .unwrap());
        assert_eq!(m.take_dirty("c1"), vec![zone_attr()]);
        assert!(m.take_dirty("c1").is_empty());
        assert_eq!(m.snapshot("c1").unwrap().active_zone(), Some(2));
    }

    #[test]
    fn unknown_controller_is_rejected() {
        let m = model();
        let err = m
            .apply_update("nope", zone_attr(), StateValue::Int(1), UpdateSource::Poll, at(0))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTarget(_)));
    }

    #[test]
    fn older_update_is_ignored() {
        let m = model();
        m.apply_update("c1", zone_attr(), StateValue::Int(2), UpdateSource::Poll, at(100))
            .unwrap();
        m.apply_update("c1", zone_attr(), StateValue::Int(1), UpdateSource::Poll, at(50))
            .unwrap();
        assert_eq!(m.snapshot("c1").unwrap().active_zone(), Some(2));
    }

    #[test]
    fn webhook_beats_nearby_poll_in_either_order() {
        let updates = [
            (StateValue::Int(3), UpdateSource::Webhook, at(0)),
            (StateValue::Int(0), UpdateSource::Poll, at(60)),
        ];
        for order in [[0usize, 1], [1, 0]] {
            let m = model();
            for i in order {
                let (v, s, t) = updates[i].clone();
                m.apply_update("c1", zone_attr(), v, s, t).unwrap();
            }
            assert_eq!(m.snapshot("c1").unwrap().active_zone(), Some(3), "order {order:?}");
        }
    }

    #[test]
    fn poll_well_after_webhook_wins() {
        let m = model();
        m.apply_update("c1", zone_attr(), StateValue::Int(3), UpdateSource::Webhook, at(0))
            .unwrap();
        m.apply_update("c1", zone_attr(), StateValue::Int(0), UpdateSource::Poll, at(400))
            .unwrap();
        assert_eq!(m.snapshot("c1").unwrap().active_zone(), Some(0));
    }

    #[test]
    fn final_value_is_order_independent() {
        let updates = vec![
            (StateValue::Int(1), UpdateSource::Poll, at(0)),
            (StateValue::Int(2), UpdateSource::Webhook, at(100)),
            (StateValue::Int(3), UpdateSource::Poll, at(200)),
            (StateValue::Int(4), UpdateSource::Poll, at(500)),
            (StateValue::Int(5), UpdateSource::Webhook, at(450)),
        ];
        let expected = {
            let m = model();
            for (v, s, t) in updates.clone() {
                m.apply_update("c1", zone_attr(), v, s, t).unwrap();
            }
            m.snapshot("c1").unwrap().active_zone()
        };
        assert_eq!(expected, Some(5));

        let mut order: Vec<usize> = (0..updates.len()).collect();
        for _ in 0..40 {
            order.rotate_left(1);
            let mid = order.len() / 2;
            order.swap(0, mid);
            let m = model();
            for &i in &order {
                let (v, s, t) = updates[i].clone();
                m.apply_update("c1", zone_attr(), v, s, t).unwrap();
            }
            assert_eq!(m.snapshot("c1").unwrap().active_zone(), expected, "order {order:?}");
        }
    }

    #[test]
    fn pending_command_suppresses_contradicting_poll() {
        let m = model();
        let standby = Attribute::Device(DeviceField::InStandbyMode);
        let now = Utc::now();
        m.apply_update("c1", standby.clone(), StateValue::Bool(false), UpdateSource::Poll, now)
            .unwrap();

        let id = m
            .submit_command(
                "c1",
                ActionKind::SetStandbyMode { enabled: true },
                standby.clone(),
                StateValue::Bool(true),
            )
            .unwrap();
        m.apply_update("c1", standby.clone(), StateValue::Bool(true), UpdateSource::Command, Utc::now())
            .unwrap();
        m.acknowledge_command("c1", id);
        assert_eq!(m.pending_commands("c1")[0].state, CommandState::Acknowledged);

        m.apply_update("c1", standby.clone(), StateValue::Bool(false), UpdateSource::Poll, Utc::now())
            .unwrap();
        assert_eq!(m.snapshot("c1").unwrap().in_standby_mode(), Some(true));

        // Confirmation clears the guard.
        m.apply_update("c1", standby.clone(), StateValue::Bool(true), UpdateSource::Poll, Utc::now())
            .unwrap();
        assert!(m.pending_commands("c1").is_empty());
    }

    #[test]
    fn pending_command_expires_after_settle_window() {
        let m = model();
        let standby = Attribute::Device(DeviceField::InStandbyMode);
        m.submit_command(
            "c1",
            ActionKind::SetStandbyMode { enabled: true },
            standby.clone(),
            StateValue::Bool(true),
        )
        .unwrap();
        let later = Utc::now() + TimeDelta::seconds(600);
        m.apply_update("c1", standby, StateValue::Bool(false), UpdateSource::Poll, later)
            .unwrap();
        assert!(m.pending_commands("c1").is_empty());
        assert_eq!(m.snapshot("c1").unwrap().in_standby_mode(), Some(false));
    }

    #[test]
    fn failed_command_is_removed() {
        let m = model();
        let id = m
            .submit_command(
                "c1",
                ActionKind::StopWatering,
                zone_attr(),
                StateValue::Int(0),
            )
            .unwrap();
        let failed = m.fail_command("c1", id).unwrap();
        assert_eq!(failed.state, CommandState::Failed);
        assert!(m.pending_commands("c1").is_empty());
    }

    #[test]
    fn callbacks_receive_old_and_new() {
        let mut m = DeviceStateModel::new(WINDOW, WINDOW);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        m.on_change(move |c| {
            seen_cb
                .lock()
                .unwrap()
                .push((c.attribute.clone(), c.old.clone(), c.new.clone()))
        });
        m.register("c1", UnitSystem::Metric);

        m.apply_batch(
            "c1",
            vec![
                (zone_attr(), StateValue::Int(1)),
                (Attribute::Device(DeviceField::Paused), StateValue::Bool(false)),
            ],
            UpdateSource::Poll,
            at(0),
        )
        .unwrap();
        m.apply_update("c1", zone_attr(), StateValue::Int(4), UpdateSource::Webhook, at(5))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (zone_attr(), Some(StateValue::Int(1)), StateValue::Int(4)));
    }

    #[test]
    fn callback_may_read_model() {
        let slot: Arc<StdMutex<Option<Arc<DeviceStateModel>>>> = Arc::new(StdMutex::new(None));
        let slot_cb = slot.clone();
        let reads = Arc::new(StdMutex::new(0));
        let reads_cb = reads.clone();

        let mut m = DeviceStateModel::new(WINDOW, WINDOW);
        m.on_change(move |c| {
            if let Some(model) = slot_cb.lock().unwrap().as_ref() {
                assert!(model.snapshot(&c.controller_id).is_some());
                *reads_cb.lock().unwrap() += 1;
            }
        });
        let m = Arc::new(m);
        *slot.lock().unwrap() = Some(m.clone());
        m.register("c1", UnitSystem::Metric);
        m.apply_update("c1", zone_attr(), StateValue::Int(1), UpdateSource::Poll, at(0))
            .unwrap();
        assert_eq!(*reads.lock().unwrap(), 1);
    }

    #[test]
    fn find_schedule_across_controllers() {
        let m = model();
        m.register("c2", UnitSystem::Metric);
        m.set_reference_data(
            "c2",
            vec![],
            vec![Schedule {
                id: "s9".into(),
                name: "Evening".into(),
                runnable: true,
                seasonal_adjustment: None,
            }],
        );
        let (controller, schedule) = m.find_schedule("s9").unwrap();
        assert_eq!(controller, "c2");
        assert_eq!(schedule.name, "Evening");
        assert!(m.find_schedule("missing").is_none());
    }

    #[test]
    fn deregister_drops_state() {
        let m = model();
        assert!(m.deregister("c1"));
        assert!(m.snapshot("c1").is_none());
        assert!(!m.deregister("c1"));
    }
}

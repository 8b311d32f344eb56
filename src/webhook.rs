use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::Filter;

use crate::engine::Context;
use crate::protocol::SUBSCRIBED_EVENT_TYPES;
use crate::sync::stopped;
use crate::types::*;
use crate::{Error, Result};

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub controller_id: String,
    pub event_type: String,
    pub sub_type: Option<String>,
    pub category: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    device_id: String,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(rename = "type", default)]
    legacy_type: Option<String>,
    #[serde(default)]
    sub_type: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
}

impl WebhookEnvelope {
    /// `timestamp` may be epoch milliseconds or RFC 3339 and is required.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedResponse(format!("webhook body: {e}")))?;
        let raw: RawEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| Error::MalformedResponse(format!("webhook envelope: {e}")))?;

        let event_type = raw
            .event_type
            .or(raw.legacy_type)
            .ok_or_else(|| Error::MalformedResponse("webhook without event type".to_string()))?;

        let timestamp = match raw.timestamp {
            None | Some(Value::Null) => {
                return Err(Error::MalformedResponse("webhook without timestamp".to_string()));
            }
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| Error::MalformedResponse(format!("webhook timestamp {n}")))?,
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::MalformedResponse(format!("webhook timestamp {s:?}: {e}")))?,
            Some(other) => {
                return Err(Error::MalformedResponse(format!("webhook timestamp {other}")));
            }
        };

        Ok(Self {
            controller_id: raw.device_id,
            event_type,
            sub_type: raw.sub_type,
            category: raw.category,
            timestamp,
            payload,
        })
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    fn dedup_key(&self) -> (String, i64, String) {
        (
            self.controller_id.clone(),
            self.timestamp.timestamp_millis(),
            self.event_type.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    ZoneStarted { zone_number: u32 },
    ZoneStopped,
    ZoneCompleted,
    ScheduleStarted { name: String },
    ScheduleStopped,
    ScheduleCompleted,
    DeviceOnline,
    DeviceOffline,
    StandbyOn,
    StandbyOff,
    RainDelayOn,
    RainDelayOff,
    Unknown(String),
}

impl WebhookEvent {
    /// Accepts both the `*_EVENT` names and the older `type`/`subType` pairs.
    pub fn classify(envelope: &WebhookEnvelope) -> Self {
        let name = envelope
            .event_type
            .strip_suffix("_EVENT")
            .unwrap_or(&envelope.event_type);
        let sub = envelope.sub_type.as_deref();

        match (name, sub) {
            ("DEVICE_ZONE_RUN_STARTED", _) | ("ZONE_STATUS", Some("ZONE_STARTED")) => {
                match envelope.payload.get("zoneNumber").and_then(Value::as_u64) {
                    Some(n) => WebhookEvent::ZoneStarted {
                        zone_number: n as u32,
                    },
                    None => WebhookEvent::Unknown(format!("{name} without zoneNumber")),
                }
            }
            ("DEVICE_ZONE_RUN_STOPPED", _) | ("ZONE_STATUS", Some("ZONE_STOPPED")) => {
                WebhookEvent::ZoneStopped
            }
            ("DEVICE_ZONE_RUN_COMPLETED", _) | ("ZONE_STATUS", Some("ZONE_COMPLETED")) => {
                WebhookEvent::ZoneCompleted
            }
            ("SCHEDULE_STARTED", _) | ("SCHEDULE_STATUS", Some("SCHEDULE_STARTED")) => {
                let name = envelope
                    .payload_str("scheduleName")
                    .or_else(|| envelope.payload_str("scheduleId"))
                    .unwrap_or("Unknown schedule");
                WebhookEvent::ScheduleStarted {
                    name: name.to_string(),
                }
            }
            ("SCHEDULE_STOPPED", _) | ("SCHEDULE_STATUS", Some("SCHEDULE_STOPPED")) => {
                WebhookEvent::ScheduleStopped
            }
            ("SCHEDULE_COMPLETED", _) | ("SCHEDULE_STATUS", Some("SCHEDULE_COMPLETED")) => {
                WebhookEvent::ScheduleCompleted
            }
            ("DEVICE_STATUS", Some("ONLINE")) => WebhookEvent::DeviceOnline,
            ("DEVICE_STATUS", Some("OFFLINE")) => WebhookEvent::DeviceOffline,
            ("DEVICE_STATUS", Some("SLEEP_MODE_ON")) => WebhookEvent::StandbyOn,
            ("DEVICE_STATUS", Some("SLEEP_MODE_OFF")) => WebhookEvent::StandbyOff,
            ("RAIN_DELAY", Some("RAIN_DELAY_ON")) => WebhookEvent::RainDelayOn,
            ("RAIN_DELAY", Some("RAIN_DELAY_OFF")) => WebhookEvent::RainDelayOff,
            _ => WebhookEvent::Unknown(match sub {
                Some(sub) => format!("{}/{sub}", envelope.event_type),
                None => envelope.event_type.clone(),
            }),
        }
    }

    pub fn updates(&self) -> Vec<(Attribute, StateValue)> {
        use DeviceField::*;
        let text = |s: &str| StateValue::Text(s.to_string());
        match self {
            WebhookEvent::ZoneStarted { zone_number } => {
                vec![(Attribute::Device(ActiveZone), StateValue::Int(*zone_number as i64))]
            }
            WebhookEvent::ZoneStopped | WebhookEvent::ZoneCompleted => {
                vec![(Attribute::Device(ActiveZone), StateValue::Int(0))]
            }
            WebhookEvent::ScheduleStarted { name } => vec![
                (Attribute::Device(ActiveSchedule), text(name)),
                (
                    Attribute::Device(ScheduleModeType),
                    text(ScheduleMode::Automatic.as_api_str()),
                ),
            ],
            WebhookEvent::ScheduleStopped | WebhookEvent::ScheduleCompleted => vec![
                (Attribute::Device(ActiveSchedule), text(NO_ACTIVE_SCHEDULE)),
                (Attribute::Device(ActiveZone), StateValue::Int(0)),
            ],
            WebhookEvent::DeviceOnline => vec![(
                Attribute::Device(Status),
                text(ConnectivityStatus::Online.as_api_str()),
            )],
            WebhookEvent::DeviceOffline => vec![(
                Attribute::Device(Status),
                text(ConnectivityStatus::Offline.as_api_str()),
            )],
            WebhookEvent::StandbyOn => vec![(Attribute::Device(InStandbyMode), StateValue::Bool(true))],
            WebhookEvent::StandbyOff => {
                vec![(Attribute::Device(InStandbyMode), StateValue::Bool(false))]
            }
            WebhookEvent::RainDelayOn => vec![(Attribute::Device(RainDelay), StateValue::Bool(true))],
            WebhookEvent::RainDelayOff => vec![(Attribute::Device(RainDelay), StateValue::Bool(false))],
            WebhookEvent::Unknown(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Queued,
    Duplicate,
    /// Unknown event type or unregistered controller.
    Discarded,
}

type QueuedEvent = (WebhookEnvelope, WebhookEvent);

pub struct WebhookReceiver {
    ctx: Arc<Context>,
    seen: DashMap<(String, i64, String), Instant>,
    tx: mpsc::UnboundedSender<QueuedEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedEvent>>>,
}

impl WebhookReceiver {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            seen: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Never waits on state updates; accepted events are applied by the worker.
    pub fn receive(&self, body: &[u8]) -> Result<Acceptance> {
        let envelope = WebhookEnvelope::decode(body)?;
        self.ctx.client.log_webhook(&envelope.payload);
        info!(
            controller = %envelope.controller_id,
            event = %envelope.event_type,
            sub_type = envelope.sub_type.as_deref().unwrap_or(""),
            category = envelope.category.as_deref().unwrap_or(""),
            summary = envelope.payload_str("summary").unwrap_or(""),
            "webhook received"
        );
        Ok(self.accept(envelope))
    }

    pub fn accept(&self, envelope: WebhookEnvelope) -> Acceptance {
        let event = WebhookEvent::classify(&envelope);
        if let WebhookEvent::Unknown(ref what) = event {
            info!(controller = %envelope.controller_id, "discarding unknown webhook event {what}");
            return Acceptance::Discarded;
        }
        if !self.ctx.model.contains(&envelope.controller_id) {
            debug!(controller = %envelope.controller_id, "webhook for unregistered controller");
            return Acceptance::Discarded;
        }
        if self.rx.lock().is_some() {
            warn!(controller = %envelope.controller_id, "no webhook worker running, event dropped");
            return Acceptance::Discarded;
        }
        if !self.first_delivery(&envelope) {
            debug!(controller = %envelope.controller_id, event = %envelope.event_type, "duplicate webhook ignored");
            return Acceptance::Duplicate;
        }
        if self.tx.send((envelope, event)).is_err() {
            warn!("webhook queue closed, event dropped");
            return Acceptance::Discarded;
        }
        Acceptance::Queued
    }

    fn first_delivery(&self, envelope: &WebhookEnvelope) -> bool {
        let retention = self.ctx.config.dedup_retention;
        let now = Instant::now();
        self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < retention);

        match self.seen.entry(envelope.dedup_key()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(v) => {
                v.insert(now);
                true
            }
        }
    }

    fn apply(&self, envelope: &WebhookEnvelope, event: &WebhookEvent) {
        let updates = event.updates();
        match self.ctx.model.apply_batch(
            &envelope.controller_id,
            updates,
            UpdateSource::Webhook,
            envelope.timestamp,
        ) {
            Ok(changes) => debug!(
                controller = %envelope.controller_id,
                ?event,
                changes = changes.len(),
                "webhook applied"
            ),
            Err(e) => debug!(controller = %envelope.controller_id, "webhook dropped: {e}"),
        }
    }

    /// `None` once taken. Drains the queue on shutdown.
    pub(crate) fn take_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<impl Future<Output = ()> + Send + use<>> {
        let mut rx = self.rx.lock().take()?;
        let this = self.clone();
        Some(async move {
            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some((envelope, event)) => this.apply(&envelope, &event),
                        None => break,
                    },
                    _ = stopped(&mut shutdown) => {
                        while let Ok((envelope, event)) = rx.try_recv() {
                            this.apply(&envelope, &event);
                        }
                        break;
                    }
                }
            }
            debug!("webhook worker stopped");
        })
    }

    fn authorized(&self, query: &HashMap<String, String>, authorization: Option<&str>) -> bool {
        let Some(ref secret) = self.ctx.config.webhook_secret else {
            return true;
        };
        let secret = secret.expose_secret();
        if query.get("api_key").is_some_and(|k| k == secret) {
            return true;
        }
        authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .is_some_and(|token| token.trim() == secret)
    }

    /// `POST /webhook`; 401 on a bad secret, 400 on an undecodable body,
    /// 200 otherwise.
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::post()
            .and(warp::path("webhook"))
            .and(warp::path::end())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::content_length_limit(MAX_BODY_BYTES))
            .and(warp::body::bytes())
            .map(
                move |query: HashMap<String, String>, auth: Option<String>, body: Bytes| {
                    if !self.authorized(&query, auth.as_deref()) {
                        warn!("webhook rejected: bad or missing secret");
                        return warp::reply::with_status(
                            warp::reply::json(&json!({ "error": "unauthorized" })),
                            StatusCode::UNAUTHORIZED,
                        );
                    }
                    match self.receive(&body) {
                        Ok(acceptance) => warp::reply::with_status(
                            warp::reply::json(&json!({ "status": acceptance_label(acceptance) })),
                            StatusCode::OK,
                        ),
                        Err(e) => {
                            debug!("undecodable webhook: {e}");
                            warp::reply::with_status(
                                warp::reply::json(&json!({ "error": e.to_string() })),
                                StatusCode::BAD_REQUEST,
                            )
                        }
                    }
                },
            )
    }

    pub(crate) fn bind(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
        warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(addr, async move { stopped(&mut shutdown).await })
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }

    /// Per-type registration failures are logged and skipped.
    pub async fn subscribe(&self, controller_id: &str, callback_url: &str) -> Result<usize> {
        let ctx = &self.ctx;
        ctx.governor.reserve(1).await?;
        let types = ctx.client.webhook_event_types().await?;

        let mut created = 0;
        for event_type in types
            .iter()
            .filter(|t| SUBSCRIBED_EVENT_TYPES.contains(&t.name.as_str()))
        {
            ctx.governor.reserve(1).await?;
            match ctx
                .client
                .create_webhook(controller_id, callback_url, &event_type.id)
                .await
            {
                Ok(()) => created += 1,
                Err(e) => warn!(controller = %controller_id, event = %event_type.name, "webhook registration failed: {e}"),
            }
        }
        info!(controller = %controller_id, created, "webhooks registered");
        Ok(created)
    }

    pub async fn unsubscribe(&self, controller_id: &str) -> Result<usize> {
        let ctx = &self.ctx;
        ctx.governor.reserve(1).await?;
        let hooks = ctx.client.list_webhooks(controller_id).await?;

        let mut deleted = 0;
        for hook in hooks
            .iter()
            .filter(|h| h.external_id.as_deref() == Some(controller_id))
        {
            ctx.governor.reserve(1).await?;
            match ctx.client.delete_webhook(&hook.id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(controller = %controller_id, webhook = %hook.id, "webhook removal failed: {e}"),
            }
        }
        info!(controller = %controller_id, deleted, "webhooks removed");
        Ok(deleted)
    }
}

fn acceptance_label(acceptance: Acceptance) -> &'static str {
    match acceptance {
        Acceptance::Queued => "queued",
        Acceptance::Duplicate => "duplicate",
        Acceptance::Discarded => "discarded",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(mut body: Value) -> WebhookEnvelope {
        if body.get("timestamp").is_none() {
            body["timestamp"] = json!(1_700_000_000_000i64);
        }
        WebhookEnvelope::decode(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn decode_millisecond_timestamp() {
        let env = envelope(json!({
            "deviceId": "c1",
            "eventType": "DEVICE_ZONE_RUN_STARTED_EVENT",
            "category": "DEVICE",
            "timestamp": 1_700_000_000_123i64,
            "zoneNumber": 4
        }));
        assert_eq!(env.controller_id, "c1");
        assert_eq!(env.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(env.category.as_deref(), Some("DEVICE"));
    }

    #[test]
    fn decode_rfc3339_timestamp_and_legacy_type() {
        let env = envelope(json!({
            "deviceId": "c1",
            "type": "DEVICE_STATUS",
            "subType": "SLEEP_MODE_ON",
            "timestamp": "2024-05-01T12:00:00Z"
        }));
        assert_eq!(env.event_type, "DEVICE_STATUS");
        assert_eq!(env.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(WebhookEvent::classify(&env), WebhookEvent::StandbyOn);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(WebhookEnvelope::decode(b"not json").is_err());
        assert!(WebhookEnvelope::decode(br#"{"type":"X"}"#).is_err());
        assert!(WebhookEnvelope::decode(br#"{"deviceId":"c1"}"#).is_err());
        assert!(WebhookEnvelope::decode(br#"{"deviceId":"c1","type":"X","timestamp":true}"#).is_err());
    }

    #[test]
    fn decode_requires_timestamp() {
        for body in [
            br#"{"deviceId":"c1","eventType":"DEVICE_ZONE_RUN_STOPPED_EVENT"}"#.as_slice(),
            br#"{"deviceId":"c1","eventType":"DEVICE_ZONE_RUN_STOPPED_EVENT","timestamp":null}"#.as_slice(),
        ] {
            assert!(matches!(
                WebhookEnvelope::decode(body),
                Err(Error::MalformedResponse(_))
            ));
        }
    }

    #[test]
    fn classify_zone_events() {
        let started = envelope(json!({
            "deviceId": "c1",
            "eventType": "DEVICE_ZONE_RUN_STARTED_EVENT",
            "zoneNumber": 2,
            "zoneName": "Front"
        }));
        assert_eq!(
            WebhookEvent::classify(&started),
            WebhookEvent::ZoneStarted { zone_number: 2 }
        );
        let legacy = envelope(json!({
            "deviceId": "c1",
            "type": "ZONE_STATUS",
            "subType": "ZONE_COMPLETED"
        }));
        assert_eq!(WebhookEvent::classify(&legacy), WebhookEvent::ZoneCompleted);
        assert_eq!(
            WebhookEvent::ZoneCompleted.updates(),
            vec![(Attribute::Device(DeviceField::ActiveZone), StateValue::Int(0))]
        );
    }

    #[test]
    fn schedule_started_sets_name_and_mode() {
        let env = envelope(json!({
            "deviceId": "c1",
            "eventType": "SCHEDULE_STARTED_EVENT",
            "scheduleName": "Morning"
        }));
        let event = WebhookEvent::classify(&env);
        let updates = event.updates();
        assert_eq!(
            updates[0],
            (
                Attribute::Device(DeviceField::ActiveSchedule),
                StateValue::Text("Morning".into())
            )
        );
        assert_eq!(
            updates[1],
            (
                Attribute::Device(DeviceField::ScheduleModeType),
                StateValue::Text("AUTOMATIC".into())
            )
        );
    }

    #[test]
    fn schedule_completed_clears_run() {
        let env = envelope(json!({
            "deviceId": "c1",
            "eventType": "SCHEDULE_COMPLETED_EVENT",
            "scheduleName": "Morning"
        }));
        let updates = WebhookEvent::classify(&env).updates();
        assert!(updates.contains(&(
            Attribute::Device(DeviceField::ActiveSchedule),
            StateValue::Text(NO_ACTIVE_SCHEDULE.into())
        )));
    }

    #[test]
    fn rain_delay_and_status() {
        let rain = envelope(json!({"deviceId": "c1", "type": "RAIN_DELAY", "subType": "RAIN_DELAY_ON"}));
        assert_eq!(WebhookEvent::classify(&rain), WebhookEvent::RainDelayOn);
        let offline = envelope(json!({"deviceId": "c1", "type": "DEVICE_STATUS", "subType": "OFFLINE"}));
        assert_eq!(
            WebhookEvent::classify(&offline).updates(),
            vec![(
                Attribute::Device(DeviceField::Status),
                StateValue::Text("OFFLINE".into())
            )]
        );
    }

    #[test]
    fn unknown_events_have_no_updates() {
        let env = envelope(json!({"deviceId": "c1", "type": "WEATHER_INTELLIGENCE", "subType": "WEATHER_SKIP"}));
        let event = WebhookEvent::classify(&env);
        assert_eq!(event, WebhookEvent::Unknown("WEATHER_INTELLIGENCE/WEATHER_SKIP".into()));
        assert!(event.updates().is_empty());

        let missing_zone = envelope(json!({"deviceId": "c1", "eventType": "DEVICE_ZONE_RUN_STARTED_EVENT"}));
        assert!(matches!(WebhookEvent::classify(&missing_zone), WebhookEvent::Unknown(_)));
    }
}

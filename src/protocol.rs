use serde::Deserialize;
use serde_json::{json, Value};

use crate::types::*;
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.rach.io/1/public/";

/// Longest single zone run the remote service accepts, in seconds.
pub const MAX_ZONE_RUNTIME_SECS: u32 = 10_800;

pub const PERSON_INFO_PATH: &str = "person/info";
pub const WEBHOOK_EVENT_TYPES_PATH: &str = "notification/webhook_event_type";
pub const WEBHOOK_PATH: &str = "notification/webhook";
pub const SCHEDULE_START_PATH: &str = "schedulerule/start";
pub const SEASONAL_ADJUSTMENT_PATH: &str = "schedulerule/seasonal_adjustment";
pub const DEVICE_ON_PATH: &str = "device/on";
pub const DEVICE_OFF_PATH: &str = "device/off";
pub const STOP_WATER_PATH: &str = "device/stop_water";
pub const ZONE_START_PATH: &str = "zone/start";

/// Webhook event names the engine subscribes to. Anything else the service
/// offers is left unsubscribed.
pub const SUBSCRIBED_EVENT_TYPES: &[&str] = &[
    "DEVICE_STATUS_EVENT",
    "RAIN_DELAY_EVENT",
    "SCHEDULE_STATUS_EVENT",
    "ZONE_STATUS_EVENT",
    "DEVICE_ZONE_RUN_STARTED_EVENT",
    "DEVICE_ZONE_RUN_STOPPED_EVENT",
    "DEVICE_ZONE_RUN_COMPLETED_EVENT",
    "SCHEDULE_STARTED_EVENT",
    "SCHEDULE_STOPPED_EVENT",
    "SCHEDULE_COMPLETED_EVENT",
];

pub fn person_path(person_id: &str) -> String {
    format!("person/{person_id}")
}

pub fn device_path(controller_id: &str) -> String {
    format!("device/{controller_id}")
}

pub fn current_schedule_path(controller_id: &str) -> String {
    format!("device/{controller_id}/current_schedule")
}

pub fn forecast_path(controller_id: &str, units: UnitSystem) -> String {
    format!("device/{controller_id}/forecast?units={}", units.as_api_param())
}

pub fn schedule_rule_path(schedule_id: &str) -> String {
    format!("schedulerule/{schedule_id}")
}

pub fn controller_webhooks_path(controller_id: &str) -> String {
    format!("notification/{controller_id}/webhook")
}

pub fn webhook_delete_path(webhook_id: &str) -> String {
    format!("notification/webhook/{webhook_id}")
}

pub fn id_body(id: &str) -> Value {
    json!({ "id": id })
}

/// `percent` is in [-100, 100]; the service expects the fraction.
pub fn seasonal_adjustment_body(schedule_id: &str, percent: i32) -> Value {
    json!({
        "id": schedule_id,
        "adjustment": percent as f64 * 0.01
    })
}

pub fn zone_start_body(zone_id: &str, duration_secs: u32) -> Value {
    json!({
        "id": zone_id,
        "duration": duration_secs
    })
}

pub fn webhook_create_body(controller_id: &str, callback_url: &str, event_type_id: &str) -> Value {
    json!({
        "device": { "id": controller_id },
        "externalId": controller_id,
        "url": callback_url,
        "eventTypes": [{ "id": event_type_id }]
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEventType {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

fn string_or_number<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, got {other}"))),
    }
}

#[derive(Deserialize)]
struct RawId {
    id: String,
}

#[derive(Deserialize)]
struct RawPerson {
    #[serde(default)]
    devices: Vec<RawDeviceSummary>,
}

#[derive(Deserialize)]
struct RawDeviceSummary {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    elevation: Option<f64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    time_zone: Option<String>,
    #[serde(default)]
    utc_offset: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    on: Option<bool>,
    #[serde(default)]
    schedule_mode_type: Option<String>,
    #[serde(default)]
    zones: Vec<RawZone>,
    #[serde(default)]
    schedule_rules: Vec<RawScheduleRule>,
    #[serde(default)]
    flex_schedule_rules: Vec<RawScheduleRule>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawZone {
    id: String,
    zone_number: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    max_runtime: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScheduleRule {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    seasonal_adjustment: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl RawScheduleRule {
    fn into_schedule(self, flex: bool) -> Schedule {
        Schedule {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            runnable: self.enabled && !flex,
            seasonal_adjustment: self.seasonal_adjustment.map(|f| (f * 100.0).round() as i32),
            id: self.id,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCurrentSchedule {
    #[serde(rename = "type", default)]
    run_type: Option<String>,
    #[serde(default)]
    schedule_rule_id: Option<String>,
    #[serde(default)]
    zone_number: Option<u32>,
}

#[derive(Deserialize)]
struct RawForecastReply {
    current: RawConditions,
    #[serde(default)]
    forecast: Vec<RawConditions>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawConditions {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    current_temperature: Option<f64>,
    #[serde(default)]
    temperature_min: Option<f64>,
    #[serde(default)]
    temperature_max: Option<f64>,
    #[serde(default)]
    dew_point: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    cloud_cover: Option<f64>,
    #[serde(default)]
    wind_speed: Option<f64>,
    #[serde(default)]
    precip_intensity: Option<f64>,
    #[serde(default)]
    precip_probability: Option<f64>,
    #[serde(default)]
    calculated_precip: Option<f64>,
    #[serde(default)]
    weather_summary: Option<String>,
    #[serde(default)]
    icon_url: Option<String>,
    #[serde(default)]
    weather_type: Option<String>,
}

fn round_to(v: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (v * factor).round() / factor
}

fn percentage(v: f64) -> f64 {
    (v * 100.0).round()
}

impl RawConditions {
    fn conditions(&self) -> Conditions {
        Conditions {
            dew_point: self.dew_point.map(|v| round_to(v, 1)),
            humidity: self.humidity.map(percentage),
            cloud_cover: self.cloud_cover.map(percentage),
            wind_speed: self.wind_speed.map(|v| round_to(v, 2)),
            precip_intensity: self.precip_intensity.map(|v| round_to(v, 4)),
            precip_probability: self.precip_probability.map(percentage),
            precip_total: self.calculated_precip.map(|v| round_to(v, 2)),
            summary: self.weather_summary.clone(),
            icon_url: self.icon_url.clone(),
            weather_type: self.weather_type.as_deref().and_then(WeatherType::from_api_str),
        }
    }

    fn snapshot(&self) -> WeatherSnapshot {
        WeatherSnapshot {
            temperature: self.current_temperature.map(|v| round_to(v, 1)),
            conditions: self.conditions(),
        }
    }

    /// Forecast days ignore `currentTemperature` even when the service sends it.
    fn forecast_day(&self) -> ForecastDay {
        ForecastDay {
            temperature_min: self.temperature_min.map(|v| round_to(v, 1)),
            temperature_max: self.temperature_max.map(|v| round_to(v, 1)),
            conditions: self.conditions(),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| Error::MalformedResponse(format!("{what}: {e}")))
}

pub fn decode_person_id(body: Value) -> Result<String> {
    Ok(decode::<RawId>("person info", body)?.id)
}

pub fn decode_person_controllers(body: Value) -> Result<Vec<ControllerSummary>> {
    let person: RawPerson = decode("person", body)?;
    Ok(person
        .devices
        .into_iter()
        .map(|d| ControllerSummary {
            name: d.name.unwrap_or_else(|| d.id.clone()),
            id: d.id,
        })
        .collect())
}

/// Elevation is converted to `units` here; nothing downstream converts again.
pub fn decode_controller(body: Value, units: UnitSystem) -> Result<ControllerInfo> {
    let raw: RawDevice = decode("controller", body)?;

    let mut zones: Vec<Zone> = raw
        .zones
        .into_iter()
        .map(|z| Zone {
            name: z.name.unwrap_or_else(|| format!("Zone {}", z.zone_number)),
            id: z.id,
            zone_number: z.zone_number,
            enabled: z.enabled,
            max_runtime: z.max_runtime,
        })
        .collect();
    zones.sort_by_key(|z| z.zone_number);

    let schedules = raw
        .schedule_rules
        .into_iter()
        .map(|r| r.into_schedule(false))
        .chain(raw.flex_schedule_rules.into_iter().map(|r| r.into_schedule(true)))
        .collect();

    let controller = Controller {
        name: raw.name.unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        model: raw.model,
        serial_number: raw.serial_number,
        mac_address: raw.mac_address,
        elevation: raw.elevation.map(|m| round_to(units.elevation_from_meters(m), 1)),
        latitude: raw.latitude,
        longitude: raw.longitude,
        time_zone: raw.time_zone,
        utc_offset: raw.utc_offset,
        unit_system: units,
        status: raw.status.as_deref().and_then(ConnectivityStatus::from_api_str),
        in_standby_mode: raw.on.map(|on| !on),
        paused: false,
        schedule_mode: raw.schedule_mode_type.as_deref().and_then(ScheduleMode::from_api_str),
    };

    Ok(ControllerInfo {
        controller,
        zones,
        schedules,
    })
}

/// An empty object means nothing is running.
pub fn decode_current_schedule(body: Value) -> Result<CurrentRun> {
    if body.as_object().is_some_and(|m| m.is_empty()) || body.is_null() {
        return Ok(CurrentRun::Idle);
    }
    let raw: RawCurrentSchedule = decode("current schedule", body)?;
    match raw.run_type {
        Some(run_type) => Ok(CurrentRun::Running {
            run_type,
            schedule_rule_id: raw.schedule_rule_id,
            zone_number: raw.zone_number,
        }),
        None => Ok(CurrentRun::Idle),
    }
}

pub fn decode_schedule_rule(body: Value) -> Result<Schedule> {
    Ok(decode::<RawScheduleRule>("schedule rule", body)?.into_schedule(false))
}

/// Rejects replies with fewer than [`FORECAST_DAYS`] entries; extra entries
/// beyond that are dropped after ordering by time.
pub fn decode_weather(body: Value) -> Result<WeatherReport> {
    let mut raw: RawForecastReply = decode("forecast", body)?;
    if raw.forecast.len() < FORECAST_DAYS {
        return Err(Error::MalformedResponse(format!(
            "forecast has {} days, expected {FORECAST_DAYS}",
            raw.forecast.len()
        )));
    }
    raw.forecast.sort_by_key(|d| d.time.unwrap_or(i64::MAX));

    Ok(WeatherReport {
        current: raw.current.snapshot(),
        forecast: Forecast(
            raw.forecast
                .iter()
                .take(FORECAST_DAYS)
                .map(RawConditions::forecast_day)
                .collect(),
        ),
    })
}

pub fn decode_webhook_event_types(body: Value) -> Result<Vec<WebhookEventType>> {
    decode("webhook event types", body)
}

pub fn decode_webhooks(body: Value) -> Result<Vec<WebhookRegistration>> {
    decode("webhooks", body)
}

/// `MANUAL` -> `Manual`, `AUTOMATIC` -> `Automatic`.
pub fn title_case(s: &str) -> String {
    s.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let lower = w.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

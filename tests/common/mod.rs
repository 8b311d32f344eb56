#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rachio_sync::{Config, Fault, StateChange, SyncEngine};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "test-token";

pub fn device_json(id: &str) -> Value {
    json!({
        "id": id,
        "name": "Front Yard",
        "model": "GENERATION3_16ZONE",
        "serialNumber": "SN-1",
        "macAddress": "AA:BB:CC:DD:EE:FF",
        "elevation": 100.0,
        "latitude": 40.1,
        "longitude": -105.2,
        "timeZone": "America/Denver",
        "utcOffset": -25200000,
        "status": "ONLINE",
        "on": true,
        "scheduleModeType": "AUTOMATIC",
        "zones": [
            { "id": "z2", "zoneNumber": 2, "name": "Beds", "enabled": true, "maxRuntime": 0 },
            { "id": "z1", "zoneNumber": 1, "name": "Lawn", "enabled": true, "maxRuntime": 600 },
            { "id": "z3", "zoneNumber": 3, "name": "Spare", "enabled": false, "maxRuntime": 600 }
        ],
        "scheduleRules": [
            { "id": "s1", "name": "Morning", "enabled": true, "seasonalAdjustment": 0.1 }
        ],
        "flexScheduleRules": [
            { "id": "f1", "name": "Flex Daily", "enabled": true, "seasonalAdjustment": 0.0 }
        ]
    })
}

/// Days are listed newest first to exercise ordering by time.
pub fn forecast_json(days: usize) -> Value {
    let forecast: Vec<Value> = (0..days)
        .rev()
        .map(|d| {
            json!({
                "time": 1_700_000_000i64 + d as i64 * 86_400,
                "temperatureMin": 50.0 + d as f64,
                "temperatureMax": 80.0 + d as f64,
                "humidity": 0.5,
                "precipProbability": 0.2,
                "weatherSummary": "Clear",
                "weatherType": "clear-day"
            })
        })
        .collect();
    json!({
        "current": {
            "currentTemperature": 71.26,
            "humidity": 0.5,
            "windSpeed": 3.456,
            "weatherSummary": "Clear",
            "weatherType": "clear-day"
        },
        "forecast": forecast
    })
}

pub fn running_schedule(rule_id: &str, zone_number: u32) -> Value {
    json!({
        "type": "AUTOMATIC",
        "scheduleRuleId": rule_id,
        "zoneNumber": zone_number
    })
}

pub async fn mount_device(server: &MockServer, id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/device/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_json(id)))
        .mount(server)
        .await;
}

pub async fn mount_current_schedule(server: &MockServer, id: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/device/{id}/current_schedule")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn mount_forecast(server: &MockServer, id: &str, days: usize) {
    Mock::given(method("GET"))
        .and(path(format!("/device/{id}/forecast")))
        .and(query_param("units", "US"))
        .respond_with(ResponseTemplate::new(200).set_body_json(forecast_json(days)))
        .mount(server)
        .await;
}

/// Device, idle-or-running schedule and a full forecast for `id`.
pub async fn mount_controller(server: &MockServer, id: &str, current: Value) {
    mount_device(server, id).await;
    mount_current_schedule(server, id, current).await;
    mount_forecast(server, id, 14).await;
}

pub fn config(server: &MockServer) -> Config {
    Config::new(TOKEN)
        .api_url(server.uri())
        .request_timeout(Duration::from_secs(2))
}

pub struct Harness {
    pub engine: SyncEngine,
    pub changes: Arc<Mutex<Vec<StateChange>>>,
    pub faults: Arc<Mutex<Vec<Fault>>>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let changes: Arc<Mutex<Vec<StateChange>>> = Arc::new(Mutex::new(Vec::new()));
        let faults: Arc<Mutex<Vec<Fault>>> = Arc::new(Mutex::new(Vec::new()));
        let changes_cb = changes.clone();
        let faults_cb = faults.clone();
        let engine = SyncEngine::builder(config)
            .on_change(move |c| changes_cb.lock().unwrap().push(c.clone()))
            .on_fault(move |f| faults_cb.lock().unwrap().push(f.clone()))
            .build()
            .expect("engine should build");
        Self {
            engine,
            changes,
            faults,
        }
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().unwrap().clone()
    }

    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().unwrap().clone()
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

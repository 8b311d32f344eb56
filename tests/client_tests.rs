mod common;

use std::time::Duration;

use common::*;
use rachio_sync::{CurrentRun, Error, RachioClient, UnitSystem, WeatherType};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> RachioClient {
    RachioClient::builder(SecretString::from(TOKEN.to_string()))
        .base_url(server.uri())
        .timeout(Duration::from_millis(500))
        .build()
        .expect("client should build")
}

#[tokio::test]
async fn list_controllers_resolves_person_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/person/info"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/person/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "p1",
            "devices": [{ "id": "c1", "name": "Front Yard" }, { "id": "c2" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let controllers = client(&server).list_controllers().await.unwrap();
    assert_eq!(controllers.len(), 2);
    assert_eq!(controllers[0].name, "Front Yard");
    assert_eq!(controllers[1].name, "c2");
}

#[tokio::test]
async fn controller_info_in_metric() {
    let server = MockServer::start().await;
    mount_device(&server, "c1").await;

    let info = client(&server)
        .get_controller_info("c1", UnitSystem::Metric)
        .await
        .unwrap();
    assert_eq!(info.controller.elevation, Some(100.0));
    assert_eq!(info.controller.in_standby_mode, Some(false));
    assert!(!info.controller.paused);
    assert_eq!(info.zones[0].id, "z1");
    assert_eq!(info.schedules.len(), 2);
    assert_eq!(info.schedules[0].seasonal_adjustment, Some(10));
}

#[tokio::test]
async fn weather_requests_unit_system() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/device/c1/forecast"))
        .and(query_param("units", "METRIC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(forecast_json(16)))
        .expect(1)
        .mount(&server)
        .await;

    let weather = client(&server)
        .get_weather("c1", UnitSystem::Metric)
        .await
        .unwrap();
    assert_eq!(weather.current.temperature, Some(71.3));
    assert_eq!(weather.current.conditions.wind_speed, Some(3.46));
    assert_eq!(weather.forecast.days().len(), 14);
    assert_eq!(weather.forecast.days()[0].temperature_min, Some(50.0));
    assert_eq!(
        weather.forecast.days()[1].conditions.weather_type,
        Some(WeatherType::ClearDay)
    );
}

#[tokio::test]
async fn empty_current_schedule_is_idle() {
    let server = MockServer::start().await;
    mount_current_schedule(&server, "c1", json!({})).await;
    assert_eq!(
        client(&server).get_current_schedule("c1").await.unwrap(),
        CurrentRun::Idle
    );
}

#[tokio::test]
async fn zone_start_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/zone/start"))
        .and(body_json(json!({ "id": "z1", "duration": 300 })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    client(&server).start_zone("z1", 300).await.unwrap();
}

#[tokio::test]
async fn unauthorized_maps_to_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/person/info"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let err = client(&server).get_person_id().await.unwrap_err();
    assert!(matches!(err, Error::Auth(401)), "got {err:?}");
}

#[tokio::test]
async fn not_found_names_the_resource() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/schedulerule/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let err = client(&server).get_schedule_rule("gone").await.unwrap_err();
    match err {
        Error::NotFound(what) => assert_eq!(what, "schedulerule/gone"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn too_many_requests_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/device/c1"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;
    let err = client(&server)
        .get_controller_info("c1", UnitSystem::Imperial)
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn server_error_is_transport_class() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/device/stop_water"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let err = client(&server).stop_watering("c1").await.unwrap_err();
    assert!(matches!(err, Error::Status(503)));
    assert!(err.is_transport_class());
}

#[tokio::test]
async fn malformed_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/device/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;
    let err = client(&server)
        .get_controller_info("c1", UnitSystem::Imperial)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedResponse(_)));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/person/info"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "p1" }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    let err = client(&server).get_person_id().await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
}

#[tokio::test]
async fn token_update_applies_to_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/person/info"))
        .and(header("authorization", "Bearer rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/person/info"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(matches!(client.get_person_id().await, Err(Error::Auth(401))));
    client.set_access_token(SecretString::from("rotated".to_string()));
    assert_eq!(client.get_person_id().await.unwrap(), "p1");
}

#[tokio::test]
async fn message_log_records_requests_and_responses() {
    let server = MockServer::start().await;
    mount_device(&server, "c1").await;
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("messages.ndjson");

    let client = RachioClient::builder(SecretString::from(TOKEN.to_string()))
        .base_url(server.uri())
        .message_log(
            rachio_sync::MessageLogMode::Full,
            log_path.to_string_lossy().to_string(),
        )
        .build()
        .unwrap();
    client
        .get_controller_info("c1", UnitSystem::Imperial)
        .await
        .unwrap();

    let log = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<serde_json::Value> = log
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert!(!log.contains(TOKEN));
}

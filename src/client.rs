use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, trace};

use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::*;
use crate::types::*;
use crate::{Error, Result};

pub struct RachioClientBuilder {
    access_token: SecretString,
    base_url: String,
    timeout: Duration,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl RachioClientBuilder {
    pub fn new(access_token: SecretString) -> Self {
        Self {
            access_token,
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        self.base_url = url;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<RachioClient> {
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        Ok(RachioClient {
            http,
            base_url: self.base_url,
            access_token: RwLock::new(self.access_token),
            logger,
        })
    }
}

/// Calls are never retried here.
pub struct RachioClient {
    http: reqwest::Client,
    base_url: String,
    access_token: RwLock<SecretString>,
    logger: Option<Mutex<MessageLogger>>,
}

impl RachioClient {
    pub fn builder(access_token: SecretString) -> RachioClientBuilder {
        RachioClientBuilder::new(access_token)
    }

    /// Subsequent requests use the new token.
    pub fn set_access_token(&self, token: SecretString) {
        *self.access_token.write() = token;
    }

    pub(crate) fn log_webhook(&self, body: &Value) {
        if let Some(ref logger) = self.logger {
            logger.lock().log_webhook(body);
        }
    }

    pub async fn get_person_id(&self) -> Result<String> {
        decode_person_id(self.get(PERSON_INFO_PATH).await?)
    }

    pub async fn list_controllers(&self) -> Result<Vec<ControllerSummary>> {
        let person_id = self.get_person_id().await?;
        self.list_controllers_for(&person_id).await
    }

    pub async fn list_controllers_for(&self, person_id: &str) -> Result<Vec<ControllerSummary>> {
        decode_person_controllers(self.get(&person_path(person_id)).await?)
    }

    pub async fn get_controller_info(
        &self,
        controller_id: &str,
        units: UnitSystem,
    ) -> Result<ControllerInfo> {
        decode_controller(self.get(&device_path(controller_id)).await?, units)
    }

    pub async fn get_schedules(&self, controller_id: &str) -> Result<Vec<Schedule>> {
        let info = decode_controller(
            self.get(&device_path(controller_id)).await?,
            UnitSystem::default(),
        )?;
        Ok(info.schedules)
    }

    pub async fn get_zones(&self, controller_id: &str) -> Result<Vec<Zone>> {
        let info = decode_controller(
            self.get(&device_path(controller_id)).await?,
            UnitSystem::default(),
        )?;
        Ok(info.zones)
    }

    /// Current conditions and the 14-day forecast from a single request.
    pub async fn get_weather(&self, controller_id: &str, units: UnitSystem) -> Result<WeatherReport> {
        decode_weather(self.get(&forecast_path(controller_id, units)).await?)
    }

    pub async fn get_current_weather(
        &self,
        controller_id: &str,
        units: UnitSystem,
    ) -> Result<WeatherSnapshot> {
        Ok(self.get_weather(controller_id, units).await?.current)
    }

    pub async fn get_forecast(&self, controller_id: &str, units: UnitSystem) -> Result<Forecast> {
        Ok(self.get_weather(controller_id, units).await?.forecast)
    }

    pub async fn get_current_schedule(&self, controller_id: &str) -> Result<CurrentRun> {
        decode_current_schedule(self.get(&current_schedule_path(controller_id)).await?)
    }

    pub async fn get_schedule_rule(&self, schedule_id: &str) -> Result<Schedule> {
        decode_schedule_rule(self.get(&schedule_rule_path(schedule_id)).await?)
    }

    pub async fn run_schedule(&self, schedule_id: &str) -> Result<()> {
        self.put("run_schedule", SCHEDULE_START_PATH, &id_body(schedule_id))
            .await
    }

    pub async fn set_seasonal_adjustment(&self, schedule_id: &str, percent: i32) -> Result<()> {
        self.put(
            "set_seasonal_adjustment",
            SEASONAL_ADJUSTMENT_PATH,
            &seasonal_adjustment_body(schedule_id, percent),
        )
        .await
    }

    /// Standby on maps to `device/off`, standby off to `device/on`.
    pub async fn set_standby_mode(&self, controller_id: &str, enabled: bool) -> Result<()> {
        let path = if enabled { DEVICE_OFF_PATH } else { DEVICE_ON_PATH };
        self.put("set_standby_mode", path, &id_body(controller_id)).await
    }

    pub async fn start_zone(&self, zone_id: &str, duration_secs: u32) -> Result<()> {
        self.put("start_zone", ZONE_START_PATH, &zone_start_body(zone_id, duration_secs))
            .await
    }

    pub async fn stop_watering(&self, controller_id: &str) -> Result<()> {
        self.put("stop_watering", STOP_WATER_PATH, &id_body(controller_id))
            .await
    }

    pub async fn webhook_event_types(&self) -> Result<Vec<WebhookEventType>> {
        decode_webhook_event_types(self.get(WEBHOOK_EVENT_TYPES_PATH).await?)
    }

    pub async fn create_webhook(
        &self,
        controller_id: &str,
        callback_url: &str,
        event_type_id: &str,
    ) -> Result<()> {
        let body = webhook_create_body(controller_id, callback_url, event_type_id);
        self.request(Method::POST, WEBHOOK_PATH, Some(&body)).await?;
        Ok(())
    }

    pub async fn list_webhooks(&self, controller_id: &str) -> Result<Vec<WebhookRegistration>> {
        decode_webhooks(self.get(&controller_webhooks_path(controller_id)).await?)
    }

    pub async fn delete_webhook(&self, webhook_id: &str) -> Result<()> {
        self.request(Method::DELETE, &webhook_delete_path(webhook_id), None)
            .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let body = self.request(Method::GET, path, None).await?;
        if let Some(ref logger) = self.logger {
            logger.lock().log_response(path, 200, &body);
        }
        Ok(body)
    }

    async fn put(&self, action: &str, path: &str, body: &Value) -> Result<()> {
        if let Some(ref logger) = self.logger {
            logger.lock().log_command(action, path, body);
        }
        self.request(Method::PUT, path, Some(body)).await?;
        Ok(())
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "api request");

        if let Some(ref logger) = self.logger {
            logger.lock().log_request(method.as_str(), path, body);
        }

        let token = self.access_token.read().expose_secret().to_string();
        let mut req = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let resp = check_status(resp, path)?;
        let text = resp.text().await?;
        trace!(url = %url, bytes = text.len(), "api response");

        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text).map_err(|e| Error::MalformedResponse(format!("{path}: {e}")))
    }
}

fn check_status(resp: Response, path: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth(status.as_u16())),
        StatusCode::NOT_FOUND => Err(Error::NotFound(path.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
            retry_after: resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after),
        }),
        other => Err(Error::Status(other.as_u16())),
    }
}

/// Accepts delta-seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn retry_after_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn builder_normalizes_base_url() {
        let client = RachioClient::builder(SecretString::from("t".to_string()))
            .base_url("http://localhost:1234/api")
            .build()
            .unwrap();
        assert_eq!(client.base_url, "http://localhost:1234/api/");
    }
}

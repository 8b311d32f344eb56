use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Number of daily forecast entries kept per controller (index 0 = today).
pub const FORECAST_DAYS: usize = 14;

pub const NO_ACTIVE_SCHEDULE: &str = "No active schedule";

const METERS_TO_FEET: f64 = 3.280_84;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitSystem {
    #[default]
    Imperial,
    Metric,
}

impl UnitSystem {
    pub fn as_api_param(&self) -> &'static str {
        match self {
            UnitSystem::Imperial => "US",
            UnitSystem::Metric => "METRIC",
        }
    }

    pub fn from_config_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "us" | "imperial" => Some(UnitSystem::Imperial),
            "metric" => Some(UnitSystem::Metric),
            _ => None,
        }
    }

    pub fn elevation_from_meters(&self, meters: f64) -> f64 {
        match self {
            UnitSystem::Imperial => meters * METERS_TO_FEET,
            UnitSystem::Metric => meters,
        }
    }

    pub fn temperature_suffix(&self) -> &'static str {
        match self {
            UnitSystem::Imperial => "\u{00b0}F",
            UnitSystem::Metric => "\u{00b0}C",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            ConnectivityStatus::Online => "ONLINE",
            ConnectivityStatus::Offline => "OFFLINE",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(ConnectivityStatus::Online),
            "OFFLINE" => Some(ConnectivityStatus::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Manual,
    Automatic,
}

impl ScheduleMode {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            ScheduleMode::Manual => "MANUAL",
            ScheduleMode::Automatic => "AUTOMATIC",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(ScheduleMode::Manual),
            "AUTOMATIC" => Some(ScheduleMode::Automatic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherType {
    Sun,
    ClearDay,
    ClearNight,
    Cloudy,
    PartlyCloudyDay,
    PartlyCloudyNight,
    Wind,
    Fog,
    Rain,
    Sleet,
    Snow,
}

impl WeatherType {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            WeatherType::Sun => "sun",
            WeatherType::ClearDay => "clear-day",
            WeatherType::ClearNight => "clear-night",
            WeatherType::Cloudy => "cloudy",
            WeatherType::PartlyCloudyDay => "partly-cloudy-day",
            WeatherType::PartlyCloudyNight => "partly-cloudy-night",
            WeatherType::Wind => "wind",
            WeatherType::Fog => "fog",
            WeatherType::Rain => "rain",
            WeatherType::Sleet => "sleet",
            WeatherType::Snow => "snow",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "sun" => Some(WeatherType::Sun),
            "clear-day" => Some(WeatherType::ClearDay),
            "clear-night" => Some(WeatherType::ClearNight),
            "cloudy" => Some(WeatherType::Cloudy),
            "partly-cloudy-day" => Some(WeatherType::PartlyCloudyDay),
            "partly-cloudy-night" => Some(WeatherType::PartlyCloudyNight),
            "wind" => Some(WeatherType::Wind),
            "fog" => Some(WeatherType::Fog),
            "rain" => Some(WeatherType::Rain),
            "sleet" => Some(WeatherType::Sleet),
            "snow" => Some(WeatherType::Snow),
            _ => None,
        }
    }
}

/// `paused` is always `false`; the API has no way to pause a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Controller {
    pub id: String,
    pub name: String,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub mac_address: Option<String>,
    pub elevation: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_zone: Option<String>,
    pub utc_offset: Option<i64>,
    pub unit_system: UnitSystem,
    pub status: Option<ConnectivityStatus>,
    pub in_standby_mode: Option<bool>,
    pub paused: bool,
    pub schedule_mode: Option<ScheduleMode>,
}

impl Controller {
    pub fn attributes(&self) -> Vec<(Attribute, StateValue)> {
        use DeviceField::*;
        vec![
            (Attribute::Device(Name), StateValue::Text(self.name.clone())),
            (Attribute::Device(Model), StateValue::text_or_unavailable(&self.model)),
            (Attribute::Device(SerialNumber), StateValue::text_or_unavailable(&self.serial_number)),
            (Attribute::Device(MacAddress), StateValue::text_or_unavailable(&self.mac_address)),
            (Attribute::Device(Elevation), StateValue::float_or_unavailable(self.elevation)),
            (Attribute::Device(Latitude), StateValue::float_or_unavailable(self.latitude)),
            (Attribute::Device(Longitude), StateValue::float_or_unavailable(self.longitude)),
            (Attribute::Device(TimeZone), StateValue::text_or_unavailable(&self.time_zone)),
            (
                Attribute::Device(UtcOffset),
                self.utc_offset.map_or(StateValue::Unavailable, StateValue::Int),
            ),
            (
                Attribute::Device(Status),
                self.status
                    .map_or(StateValue::Unavailable, |s| StateValue::Text(s.as_api_str().into())),
            ),
            (
                Attribute::Device(InStandbyMode),
                self.in_standby_mode.map_or(StateValue::Unavailable, StateValue::Bool),
            ),
            (Attribute::Device(Paused), StateValue::Bool(self.paused)),
            (
                Attribute::Device(ScheduleModeType),
                self.schedule_mode
                    .map_or(StateValue::Unavailable, |m| StateValue::Text(m.as_api_str().into())),
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: String,
    pub zone_number: u32,
    pub name: String,
    pub enabled: bool,
    /// Seconds.
    pub max_runtime: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub runnable: bool,
    /// Percent in [-100, 100].
    pub seasonal_adjustment: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerInfo {
    pub controller: Controller,
    pub zones: Vec<Zone>,
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CurrentRun {
    Idle,
    Running {
        run_type: String,
        schedule_rule_id: Option<String>,
        zone_number: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conditions {
    pub dew_point: Option<f64>,
    pub humidity: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub wind_speed: Option<f64>,
    pub precip_intensity: Option<f64>,
    pub precip_probability: Option<f64>,
    pub precip_total: Option<f64>,
    pub summary: Option<String>,
    pub icon_url: Option<String>,
    pub weather_type: Option<WeatherType>,
}

impl Conditions {
    fn push_attributes(
        &self,
        key: impl Fn(WeatherField) -> Attribute,
        out: &mut Vec<(Attribute, StateValue)>,
    ) {
        use WeatherField::*;
        out.push((key(DewPoint), StateValue::float_or_unavailable(self.dew_point)));
        out.push((key(Humidity), StateValue::float_or_unavailable(self.humidity)));
        out.push((key(CloudCover), StateValue::float_or_unavailable(self.cloud_cover)));
        out.push((key(WindSpeed), StateValue::float_or_unavailable(self.wind_speed)));
        out.push((key(PrecipIntensity), StateValue::float_or_unavailable(self.precip_intensity)));
        out.push((
            key(PrecipProbability),
            StateValue::float_or_unavailable(self.precip_probability),
        ));
        out.push((key(CalculatedPrecip), StateValue::float_or_unavailable(self.precip_total)));
        out.push((key(WeatherSummary), StateValue::text_or_unavailable(&self.summary)));
        out.push((key(IconUrl), StateValue::text_or_unavailable(&self.icon_url)));
        out.push((
            key(WeatherType),
            self.weather_type
                .map_or(StateValue::Unavailable, |t| StateValue::Text(t.as_api_str().into())),
        ));
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeatherSnapshot {
    pub temperature: Option<f64>,
    pub conditions: Conditions,
}

impl WeatherSnapshot {
    pub fn attributes(&self) -> Vec<(Attribute, StateValue)> {
        let mut out = vec![(
            Attribute::CurrentWeather(WeatherField::CurrentTemperature),
            StateValue::float_or_unavailable(self.temperature),
        )];
        self.conditions.push_attributes(Attribute::CurrentWeather, &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForecastDay {
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub conditions: Conditions,
}

impl ForecastDay {
    pub fn attributes(&self, day: u8) -> Vec<(Attribute, StateValue)> {
        let mut out = vec![
            (
                Attribute::Forecast { day, field: WeatherField::TemperatureMin },
                StateValue::float_or_unavailable(self.temperature_min),
            ),
            (
                Attribute::Forecast { day, field: WeatherField::TemperatureMax },
                StateValue::float_or_unavailable(self.temperature_max),
            ),
        ];
        self.conditions
            .push_attributes(|field| Attribute::Forecast { day, field }, &mut out);
        out
    }
}

/// Exactly [`FORECAST_DAYS`] entries; construction is only possible through decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast(pub(crate) Vec<ForecastDay>);

impl Forecast {
    pub fn days(&self) -> &[ForecastDay] {
        &self.0
    }

    pub fn attributes(&self) -> Vec<(Attribute, StateValue)> {
        self.0
            .iter()
            .enumerate()
            .flat_map(|(day, entry)| entry.attributes(day as u8))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReport {
    pub current: WeatherSnapshot,
    pub forecast: Forecast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceField {
    Name,
    Model,
    SerialNumber,
    MacAddress,
    Elevation,
    Latitude,
    Longitude,
    TimeZone,
    UtcOffset,
    Status,
    InStandbyMode,
    Paused,
    ScheduleModeType,
    ActiveSchedule,
    ActiveZone,
    RainDelay,
}

impl DeviceField {
    pub fn key(&self) -> &'static str {
        match self {
            DeviceField::Name => "name",
            DeviceField::Model => "model",
            DeviceField::SerialNumber => "serialNumber",
            DeviceField::MacAddress => "address",
            DeviceField::Elevation => "elevation",
            DeviceField::Latitude => "latitude",
            DeviceField::Longitude => "longitude",
            DeviceField::TimeZone => "timeZone",
            DeviceField::UtcOffset => "utcOffset",
            DeviceField::Status => "status",
            DeviceField::InStandbyMode => "inStandbyMode",
            DeviceField::Paused => "paused",
            DeviceField::ScheduleModeType => "scheduleModeType",
            DeviceField::ActiveSchedule => "activeSchedule",
            DeviceField::ActiveZone => "activeZone",
            DeviceField::RainDelay => "rainDelay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeatherField {
    CurrentTemperature,
    TemperatureMin,
    TemperatureMax,
    DewPoint,
    Humidity,
    CloudCover,
    WindSpeed,
    PrecipIntensity,
    PrecipProbability,
    CalculatedPrecip,
    WeatherSummary,
    IconUrl,
    WeatherType,
}

impl WeatherField {
    pub fn key(&self) -> &'static str {
        match self {
            WeatherField::CurrentTemperature => "currentTemperature",
            WeatherField::TemperatureMin => "temperatureMin",
            WeatherField::TemperatureMax => "temperatureMax",
            WeatherField::DewPoint => "dewPoint",
            WeatherField::Humidity => "humidity",
            WeatherField::CloudCover => "cloudCover",
            WeatherField::WindSpeed => "windSpeed",
            WeatherField::PrecipIntensity => "precipIntensity",
            WeatherField::PrecipProbability => "precipProbability",
            WeatherField::CalculatedPrecip => "calculatedPrecip",
            WeatherField::WeatherSummary => "weatherSummary",
            WeatherField::IconUrl => "iconUrl",
            WeatherField::WeatherType => "weatherType",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    Device(DeviceField),
    CurrentWeather(WeatherField),
    Forecast { day: u8, field: WeatherField },
    SeasonalAdjustment(String),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Device(field) => f.write_str(field.key()),
            Attribute::CurrentWeather(field) => write!(f, "current_{}", field.key()),
            Attribute::Forecast { day, field } => write!(f, "t{day}forecast_{}", field.key()),
            Attribute::SeasonalAdjustment(id) => write!(f, "seasonalAdjustment[{id}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// The remote service did not return the field.
    Unavailable,
}

impl StateValue {
    fn text_or_unavailable(v: &Option<String>) -> Self {
        v.clone().map_or(StateValue::Unavailable, StateValue::Text)
    }

    fn float_or_unavailable(v: Option<f64>) -> Self {
        v.map_or(StateValue::Unavailable, StateValue::Float)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            StateValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{b}"),
            StateValue::Int(i) => write!(f, "{i}"),
            StateValue::Float(v) => write!(f, "{v}"),
            StateValue::Text(s) => f.write_str(s),
            StateValue::Unavailable => f.write_str("unavailable from API"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Poll,
    Webhook,
    Command,
    /// Derived by the engine itself, e.g. connectivity after repeated failures.
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub controller_id: String,
    pub attribute: Attribute,
    pub old: Option<StateValue>,
    pub new: StateValue,
    pub source: UpdateSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    RunSchedule { schedule_id: String },
    SetSeasonalAdjustment { schedule_id: String, percent: i32 },
    SetStandbyMode { enabled: bool },
    StartZone {
        zone_id: String,
        zone_number: u32,
        duration_secs: u32,
    },
    StopWatering,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::RunSchedule { .. } => "run_schedule",
            ActionKind::SetSeasonalAdjustment { .. } => "set_seasonal_adjustment",
            ActionKind::SetStandbyMode { .. } => "set_standby_mode",
            ActionKind::StartZone { .. } => "start_zone",
            ActionKind::StopWatering => "stop_watering",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Submitted,
    Acknowledged,
    Failed,
}

/// An outbound action whose optimistic effect is guarded against older polls.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: Uuid,
    pub controller_id: String,
    pub action: ActionKind,
    pub attribute: Attribute,
    pub expected: StateValue,
    pub submitted_at: DateTime<Utc>,
    pub state: CommandState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCall {
    PersonInfo,
    Person,
    ControllerInfo,
    CurrentSchedule,
    Forecast,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    CommError {
        controller_id: Option<String>,
        call: ApiCall,
        message: String,
    },
    CommandFailed {
        controller_id: String,
        action: ActionKind,
        message: String,
    },
    RateLimitExceeded {
        controller_id: Option<String>,
        retry_after: Duration,
    },
    ControllerOffline {
        controller_id: String,
    },
}

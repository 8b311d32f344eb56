mod client;
mod config;
mod diff;
mod dispatch;
mod engine;
mod error;
mod governor;
mod logger;
mod protocol;
mod state;
mod sync;
mod types;
mod webhook;

pub use client::{RachioClient, RachioClientBuilder};
pub use config::Config;
pub use dispatch::{CommandDispatcher, ScheduleSelector};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Error, Result};
pub use governor::RateGovernor;
pub use logger::MessageLogMode;
pub use protocol::{MAX_ZONE_RUNTIME_SECS, WebhookEventType, WebhookRegistration};
pub use state::{ControllerSnapshot, DeviceStateModel};
pub use sync::{POLL_COST, PollSynchronizer};
pub use types::*;
pub use webhook::{Acceptance, WebhookEnvelope, WebhookEvent, WebhookReceiver};

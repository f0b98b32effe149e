use std::collections::HashMap;
use std::time::Duration;

use gotapi_core::plugin::{EventSink, Plugin, PluginError, PluginResult};
use gotapi_types::{Method, PluginInformation, PluginMessage, Service};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use super::UNKNOWN_PROFILE;

pub const SERVICE_ID: &str = "com.github.futomi.hello-clock.clock";

const TICK: Duration = Duration::from_secs(1);

/// Pushes the local time once per second while `clock/ticktack` is active.
///
/// Each plugin token has at most one running ticker.
pub struct SimpleClock {
    events: Option<EventSink>,
    tickers: HashMap<String, JoinHandle<()>>,
}

impl SimpleClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: None,
            tickers: HashMap::new(),
        }
    }

    fn start(&mut self, request: &PluginMessage) -> PluginResult {
        let Some(events) = self.events.clone() else {
            return Err(PluginError::internal("The clock is not initialized."));
        };
        let key = request.access_token.clone().unwrap_or_default();
        let origin = request.clone();

        let ticker = tokio::spawn(async move {
            let mut ticks = interval(TICK);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S").to_string();
                if events.push(&origin, Value::String(now)).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.tickers.insert(key, ticker) {
            previous.abort();
        }
        debug!("[simpleclock] Ticker started ({} active)", self.tickers.len());
        Ok(Value::Null)
    }

    fn stop(&mut self, request: &PluginMessage) -> PluginResult {
        let key = request.access_token.as_deref().unwrap_or_default();
        if let Some(ticker) = self.tickers.remove(key) {
            ticker.abort();
            debug!("[simpleclock] Ticker stopped ({} active)", self.tickers.len());
        }
        Ok(Value::Null)
    }
}

impl Default for SimpleClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimpleClock {
    fn drop(&mut self) {
        for ticker in self.tickers.values() {
            ticker.abort();
        }
    }
}

impl Plugin for SimpleClock {
    fn init(&mut self, events: EventSink) -> Result<PluginInformation, PluginError> {
        self.events = Some(events);
        Ok(PluginInformation::new(
            "Simple Clock",
            vec![Service::new(SERVICE_ID, "Simple Clock", &["clock"])],
        ))
    }

    fn handle(&mut self, request: &PluginMessage) -> PluginResult {
        if request.profile != "clock" || request.attribute != "ticktack" {
            return Err(PluginError::bad_request(UNKNOWN_PROFILE));
        }
        match request.method.unwrap_or_default() {
            Method::Put => self.start(request),
            Method::Delete => self.stop(request),
            other => Err(PluginError::bad_request(format!(
                "The HTTP Method `{other}` is not supported."
            ))),
        }
    }
}

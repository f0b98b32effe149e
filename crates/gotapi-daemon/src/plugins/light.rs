use std::collections::BTreeMap;

use gotapi_core::plugin::{EventSink, Plugin, PluginError, PluginResult};
use gotapi_types::{Method, PluginInformation, PluginMessage, Service};
use serde_json::{Map, Value};
use tracing::info;

use super::UNKNOWN_PROFILE;

pub const SERVICE_ID: &str = "com.github.futomi.lightemulator.light";

const UNKNOWN_LIGHT: &str = "The specified lightId is unknown.";

#[derive(Debug, Clone, PartialEq)]
struct Light {
    name: Value,
    color: Value,
    brightness: Value,
    flashing: Value,
    power: bool,
}

impl Light {
    fn new(name: &str) -> Self {
        Self {
            name: Value::from(name),
            color: Value::from("#ffffff"),
            brightness: Value::from(1.0),
            flashing: Value::from(0),
            power: false,
        }
    }

    /// Overwrite the settings present in `params`.
    fn configure(&mut self, params: &Map<String, Value>) {
        for (field, slot) in [
            ("name", &mut self.name),
            ("color", &mut self.color),
            ("brightness", &mut self.brightness),
            ("flashing", &mut self.flashing),
        ] {
            if let Some(value) = params.get(field) {
                slot.clone_from(value);
            }
        }
    }
}

/// Three emulated lights, `1` to `3`.
pub struct LightEmulator {
    lights: BTreeMap<String, Light>,
}

impl LightEmulator {
    #[must_use]
    pub fn new() -> Self {
        let lights = ["1", "2", "3"]
            .into_iter()
            .map(|id| (id.to_string(), Light::new(id)))
            .collect();
        Self { lights }
    }

    fn light(&mut self, params: &Map<String, Value>) -> Result<(String, &mut Light), PluginError> {
        let id = match params.get("lightId") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(PluginError::bad_request(UNKNOWN_LIGHT)),
        };
        match self.lights.get_mut(&id) {
            Some(light) => Ok((id, light)),
            None => Err(PluginError::bad_request(UNKNOWN_LIGHT)),
        }
    }
}

impl Default for LightEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for LightEmulator {
    fn init(&mut self, _events: EventSink) -> Result<PluginInformation, PluginError> {
        Ok(PluginInformation::new(
            "Light Emulator",
            vec![Service::new(SERVICE_ID, "Light", &["light"])],
        ))
    }

    fn handle(&mut self, request: &PluginMessage) -> PluginResult {
        if request.profile != "light" {
            return Err(PluginError::bad_request(UNKNOWN_PROFILE));
        }
        let method = request.method.unwrap_or_default();
        let (id, light) = match method {
            Method::Post | Method::Put | Method::Delete => self.light(&request.params)?,
            Method::Get => {
                return Err(PluginError::bad_request(format!(
                    "The HTTP Method `{method}` is not supported."
                )));
            }
        };

        match method {
            Method::Post => {
                light.configure(&request.params);
                light.power = true;
                info!("[lightemulator] Light {id} on: {light:?}");
            }
            Method::Put => {
                light.configure(&request.params);
                info!("[lightemulator] Light {id} configured: {light:?}");
            }
            Method::Delete => {
                light.power = false;
                info!("[lightemulator] Light {id} off");
            }
            Method::Get => {}
        }
        Ok(Value::Null)
    }
}

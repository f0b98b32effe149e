use gotapi_core::plugin::{EventSink, Plugin, PluginError, PluginResult};
use gotapi_types::{PluginInformation, PluginMessage, Service};
use serde_json::Value;

use super::UNKNOWN_PROFILE;

pub const SERVICE_ID: &str = "com.github.futomi.hello-world.echo";

/// Echoes `params.msg` back as the reply data.
pub struct HelloWorld;

impl Plugin for HelloWorld {
    fn init(&mut self, _events: EventSink) -> Result<PluginInformation, PluginError> {
        Ok(PluginInformation::new(
            "Hello World",
            vec![Service::new(SERVICE_ID, "hello world", &["echo"])],
        ))
    }

    fn handle(&mut self, request: &PluginMessage) -> PluginResult {
        if request.profile != "echo" {
            return Err(PluginError::bad_request(UNKNOWN_PROFILE));
        }
        Ok(request.params.get("msg").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_echo_returns_msg() {
        let mut request = PluginMessage::request("echo", "");
        request.params.insert("msg".to_string(), json!("hello"));
        assert_eq!(HelloWorld.handle(&request).unwrap(), json!("hello"));
    }

    #[test]
    fn test_echo_without_msg_is_null() {
        let request = PluginMessage::request("echo", "");
        assert_eq!(HelloWorld.handle(&request).unwrap(), Value::Null);
    }

    #[test]
    fn test_other_profile_rejected() {
        let request = PluginMessage::request("light", "");
        let err = HelloWorld.handle(&request).unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.message, UNKNOWN_PROFILE);
    }
}

//! Built-in plugins and the catalog that maps config names to them.

mod clock;
mod helloworld;
mod light;

pub use clock::SimpleClock;
pub use helloworld::HelloWorld;
pub use light::LightEmulator;

use gotapi_core::plugin::PluginRegistry;
use tracing::warn;

const UNKNOWN_PROFILE: &str = "Unknown profile was requested.";

/// Registry candidates for `names`, in the given order.
///
/// Unknown names are logged and skipped.
#[must_use]
pub fn catalog(names: &[String]) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for name in names {
        match name.as_str() {
            "helloworld" => registry.register(name.as_str(), "1.0.0", || Ok(HelloWorld)),
            "lightemulator" => {
                registry.register(name.as_str(), "1.0.0", || Ok(LightEmulator::new()));
            }
            "simpleclock" => registry.register(name.as_str(), "1.0.0", || Ok(SimpleClock::new())),
            other => warn!("Unknown plugin in config: {other}"),
        }
    }
    registry
}

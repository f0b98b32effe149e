mod dirs;
mod settings;
mod validation;

pub use dirs::Directories;
pub use settings::{Config, DEFAULT_PLUGINS, MAX_PLUGIN_RESPONSE_TIMEOUT};
pub use validation::warn_unknown_fields;

// Configuration: runtime settings, color schemes, and API-key loading.

pub mod colors;
pub mod loader;
pub mod settings;

pub use colors::ShellColorScheme;
pub use loader::{load_api_key, resolve_env_path};
pub use settings::Config;

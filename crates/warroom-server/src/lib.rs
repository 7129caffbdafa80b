pub mod handlers;
pub mod observer;
pub mod rpc;
pub mod server;
pub mod settings;

pub use handlers::HandlerState;
pub use server::{start, ServerConfig, ServerHandle};
pub use settings::{load_settings, load_settings_from_path, SettingsError, WarRoomSettings};

//! Gateway process: settings, the composition root, heartbeat and the admin
//! router.

pub mod admin;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod settings;

pub use admin::{build_router, start_admin, AdminHandle};
pub use error::{ServerError, SettingsError};
pub use manager::{Collaborators, Manager};
pub use settings::{load_settings, RelaySettings};

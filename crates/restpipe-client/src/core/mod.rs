mod controller;
mod handlers;
mod http;

pub use controller::{ActiveConnection, run_reconnect_controller};
pub use handlers::provider_from_name;
pub use http::{HttpState, router};

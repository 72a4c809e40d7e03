pub mod dashboard_routes;
pub mod dashboard_websocket;

pub use dashboard_routes::routes;

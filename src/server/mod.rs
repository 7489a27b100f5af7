//! HTTP surface: JSON over axum

pub mod handlers;
pub mod routes;

pub use handlers::system::AppState;
pub use routes::create_router;

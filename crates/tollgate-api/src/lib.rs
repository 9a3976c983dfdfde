pub mod metrics;
pub mod routes;
pub mod server;

pub use server::{app, serve, AppState};

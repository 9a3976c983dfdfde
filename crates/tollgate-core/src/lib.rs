pub mod config;
pub mod error;
pub mod exchange;
pub mod flow;
pub mod jwks;
pub mod outcome;
pub mod pending;
pub mod provider;
pub mod session;
pub mod transport;
pub mod trust;
pub mod userinfo;

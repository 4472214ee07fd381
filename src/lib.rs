#![warn(clippy::all)]

pub mod agent;
pub mod config;
pub mod desktop;
pub mod gateway;
pub mod observability;
pub mod providers;
pub mod tools;
pub mod util;

pub use config::Config;

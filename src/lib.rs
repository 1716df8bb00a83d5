//! Fill-level forecasting and collection routing for monitored receptacles.

pub mod analytics;
pub mod api;
pub mod config;
pub mod error;
pub mod forecast;
pub mod model;
pub mod planner;
pub mod routing;
pub mod schedule;
pub mod series;
pub mod state;
pub mod store;
pub mod training;

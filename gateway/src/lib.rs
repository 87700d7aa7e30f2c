pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod validate;

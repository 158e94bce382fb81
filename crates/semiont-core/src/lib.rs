pub mod commands;
pub mod config;
pub mod error;
pub mod handler;
pub mod paths;
pub mod platforms;
pub mod registry;
pub mod requirements;
pub mod results;
pub mod runner;
pub mod service;
pub mod strategy;
pub mod types;

pub use error::{Result, SemiontError};

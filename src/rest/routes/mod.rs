pub mod config;
pub mod health;
pub mod jobs;
pub mod logs;
pub mod profiles;
pub mod runners;
pub mod scenarios;
pub mod sessions;
pub mod tasks;

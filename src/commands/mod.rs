pub mod config;
pub mod run;
pub mod snapshot;
pub mod status;

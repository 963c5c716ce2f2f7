pub mod build;
pub mod clear;
pub mod query;
pub mod refresh;
pub mod status;

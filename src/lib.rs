pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod mcp;
pub mod model;
pub mod normalize;
pub mod options;
pub mod project;
pub mod runner;
pub mod schedule;
pub mod util;

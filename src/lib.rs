pub mod config;
pub mod errors;
pub mod learn;
pub mod lifecycle;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod plan;
pub mod remote;
pub mod resolver;
pub mod session;
pub mod util;

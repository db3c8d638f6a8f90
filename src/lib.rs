pub mod app;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod location;
pub mod methods;
pub mod output;
pub mod outputs;
pub mod process;
pub mod resolver;
pub mod verify;

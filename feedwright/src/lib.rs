// Library interface for feedwright modules
// This allows tests and the binary to import modules

pub mod cache;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod html;
pub mod metrics;
pub mod server;
pub mod sites;

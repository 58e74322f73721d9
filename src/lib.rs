pub mod agent;
pub(crate) mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;

pub mod util;

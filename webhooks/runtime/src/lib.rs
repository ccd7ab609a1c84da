#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use webhooks_manager_core as core;
pub use webhooks_manager_k8s_api as k8s;
pub use webhooks_manager_k8s_cache as cache;
pub use webhooks_manager_plugins as plugins;

mod admission;
mod args;
pub mod cert;
pub mod config;
pub mod events;
pub mod metrics;
pub mod server;
pub mod tls;


pub use self::{
    admission::Error,
    args::Args,
    cert::CertWatcher,
    server::{Builder, Server},
};

//! Core types shared by the dpitun lifecycle manager and its front ends.
//!
//! This crate holds everything the connection lifecycle reads but never writes:
//! the persisted settings, the DNS provider table, bind-config negotiation and
//! the elevated-privilege check.

pub mod bind;
pub mod dns;
pub mod privilege;
pub mod settings;

pub use bind::{BindConfig, BindConfigProvider, BindError, LocalBindConfig};
pub use dns::{DnsLatency, DnsProvider, rank_providers};
pub use privilege::is_elevated;
pub use settings::{
    DnsMode, DnsSettings, DpiMethod, EngineSettings, ProxyBackendKind, ProxySettings, Settings,
};

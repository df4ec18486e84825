#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]

//! Workstation-side enclave client.
//!
//! The [`client::EnclaveClient`] talks to a paired enclave device through an
//! untrusted relay: it seals requests under the pairing session key, correlates
//! responses off a background receive loop, and escalates Alert → Fail per
//! request class while honoring deadline-extending acks.

pub mod client;
pub mod config;
pub mod notify;
pub mod persist;
pub mod tracking;
pub mod transport;

pub use client::{ClientError, EnclaveClient};
pub use config::{ClientConfig, Phases, Timeouts};

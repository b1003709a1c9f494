//! Newline-delimited JSON admission protocol over TCP.

mod server;
mod service;

pub use server::{AdmissionServer, DEFAULT_MAX_LINE_BYTES};
pub use service::{AdmissionRequest, AdmissionResponse, AdmissionService};

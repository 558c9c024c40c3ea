//! Types and clients for the warden sandbox control plane.

pub mod v1;

//! Punch a TCP hole through two NATs and talk through it over TLS.
//!
//! `tete` establishes a direct, encrypted session between two peers
//! that each know the other's public address, with no rendezvous
//! server at runtime: both sides race an outbound connect loop against
//! an inbound accept loop on one shared local port, until the NAT on
//! either end lets a SYN through or both SYNs cross in a simultaneous
//! open. The surviving connection is upgraded to TLS with roles
//! arbitrated from the public addresses alone.

pub mod cert;
pub mod error;
pub mod pair;
pub mod role;
pub mod session;
pub mod socket;

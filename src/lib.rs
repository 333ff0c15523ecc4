//! Wakegate - A reverse proxy that wakes a sleeping media server on demand
//!
//! This library provides a transparent HTTP gateway that:
//! - Classifies request paths against configured wake-trigger patterns
//! - Probes the backend over TCP and sends a Wake-on-LAN magic packet when it is down
//! - Lets at most one wake sequence run at a time across concurrent requests
//! - Tells connected media clients that the server is starting, and when it is up
//! - Holds triggering requests until the backend answers or a deadline passes
//! - Forwards everything else to the backend untouched, including WebSocket upgrades

pub mod config;
pub mod error;
pub mod forward;
pub mod gate;
pub mod matcher;
pub mod notify;
pub mod probe;
pub mod proxy;
pub mod wait;
pub mod wake;
pub mod wol;

//! HTTP route handlers shared by the dialer and the agent.
//!
//! Tunnel and netportal handlers live next to their state in
//! [`crate::tunnel::relay`] and [`crate::netportal`].

pub mod health;

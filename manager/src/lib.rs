//! The cluster manager: a reactive control loop that watches the shared
//! database for connection and tunnel events and drives challenge
//! compositions, veth endpoints and VLAN bridging into the state the
//! live connections require.

pub mod actions;
pub mod handlers;
pub mod listener;
pub mod sweep;

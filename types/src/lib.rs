pub mod address;
pub mod keys;
pub mod state;

pub use address::Address;
pub use keys::*;
pub use state::{ClusterStatus, LinkState, VethState};

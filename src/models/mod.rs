//! Data models

mod certificate;
mod negotiation;
mod roster;

pub use certificate::*;
pub use negotiation::*;
pub use roster::*;

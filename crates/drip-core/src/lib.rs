mod channel;
mod rules;
mod send;
mod snapshot;
mod stats;
mod status;

pub use channel::*;
pub use rules::*;
pub use send::*;
pub use snapshot::*;
pub use stats::*;
pub use status::*;

pub use cadenza_core as core;

pub use cadenza_core::*;
pub use cadenza_graph::*;
pub use cadenza_nodes as nodes;

#[cfg(feature = "cpal")]
pub use cadenza_cpal::*;

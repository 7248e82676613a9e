//! LED panel output
//!
//! Maps rendered grids onto the panel's wiring, encodes them in the
//! controller's channel order, and streams them over a byte link.

mod encoder;
mod link;
pub mod topology;
mod transmitter;

pub use encoder::{ChannelOrder, FrameEncoder};
pub use link::{ByteLink, DEFAULT_BAUD, SerialLink, available_ports};
pub use topology::{
    FnTopology, RowMajor, SerpentineColumns, SerpentineRows, Topology, TopologyKind, index_map,
    verify_topology,
};
pub use transmitter::DeviceTransmitter;

pub mod reassembler;
pub mod sniffer;
pub mod stats;

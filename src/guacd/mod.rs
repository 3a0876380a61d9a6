//! Client side of the guacd wire protocol.
//!
//! - `instruction` — instruction type, encode/parse, stream framing
//! - `tunnel` — TCP connection, handshake, framed reads, raw writes
//! - `params` — per-protocol connection parameters

pub mod instruction;
pub mod params;
pub mod tunnel;

pub use instruction::{Instruction, InstructionReader, INTERNAL_OPCODE};
pub use params::{AssetProtocol, ConnectionParams, ProtocolOptions};
pub use tunnel::{Tunnel, TunnelConfiguration};

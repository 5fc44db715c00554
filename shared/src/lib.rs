//! Types shared between the game servers, the directory service and clients:
//! the wire protocol, the replicated grid state and the framed TCP transport.

pub mod grid;
pub mod net;
pub mod protocol;

pub use grid::{ApplyOutcome, Entity, Grid, Position, GRID_HEIGHT, GRID_WIDTH};
pub use net::{PacketReader, PacketStream, PacketWriter, MAX_FRAME_BYTES};
pub use protocol::{Packet, Update, UpdateKind};

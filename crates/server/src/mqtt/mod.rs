pub mod codec;
pub mod topic;

pub use codec::{
    Connect, ConnectReturnCode, Packet, PacketType, ProtocolError, Publish, Subscribe,
};

//! Network communication layer.

pub mod client;
pub mod codec;
pub mod rpc;
pub mod server;

pub use client::{Connection, PeerPool};
pub use codec::FrameCodec;
pub use rpc::{
    ClusterControl, ControlAction, DataTransfer, KvMessage, Message, MetadataUpdate, StatusType,
    TransferKind,
};
pub use server::{MessageHandler, NetworkServer, Reply, Session};

//! Message authentication.
//!
//! Every mutating message carries a tag: an Ed25519 signature over the fields
//! that matter for that message kind. Nodes verify client messages against the
//! client public key and control messages against the coordinator public key,
//! and refuse any tag they have seen before.

mod keys;
mod replay;

pub use keys::{MessageSigner, MessageVerifier, Signable};
pub use replay::ReplayGuard;

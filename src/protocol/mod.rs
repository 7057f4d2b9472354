//! Logging protocol shared by client and server.
//!
//! # Connection lifecycle
//!
//! ```text
//! client                                  server
//!   | -- HI {hostName, deviceID, secret} --> |  authorize
//!   | <-- AK {accepted, sourceTag: 0} ------ |  (closes after a reject)
//!   | -- EN {message, ..., tag: 100} ------> |
//!   | <-- AK {sourceTag: 100} -------------- |
//!   | -- EN {tag: 101} --------------------> |
//!   | <-- AK {sourceTag: 101} -------------- |
//! ```
//!
//! Exactly one entity is unacknowledged at any time; the next one is only
//! written once the server has acknowledged the previous tag.

pub mod frame;
pub mod message;

pub use frame::{
    decode, encode, write_frame, Frame, FrameReader, MessageType, MAX_FRAME_SIZE, MIN_FRAME_LEN,
    TERMINATOR,
};
pub use message::{
    is_entity_tag, Entity, Identity, LevelMask, ReceivedEntity, Response, Severity, SourceType,
    TagSequence, ENTITY_TAG_LIMIT, IDENTITY_TAG, INITIAL_ENTITY_TAG,
};

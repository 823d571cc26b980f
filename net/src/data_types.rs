/*
Aliases for data types for readability and to allow resizing in future
*/

pub type ChannelId = u32; // Assigned by the protocol registry, unique for the life of the registry
pub type ServerId = u32; // Assigned by the protocol registry
pub type BufferId = u32; // Slot index within a buffer pool
pub type StreamHandle = i32; // Identifies the subscription that a message belongs to
pub type MessageLength = u16; // Frames and the messages packed inside them are limited to 64KB
pub type MessageCount = u16; // Number of messages packed into one frame
pub type ProtocolVersion = u16; // Negotiated during the connection handshake
pub type FragmentId = u16; // Ties the fragments of one oversized message together

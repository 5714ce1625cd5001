//! hopcast transport core.
//! Host-driven: no I/O; host passes radio frames and scheduler callbacks, receives actions.

pub mod coordinator;
pub mod core;
pub mod message_id;
pub mod protocol;
pub mod reassembly;
pub mod scheduler;
pub mod wire;

pub use crate::core::{Action, BroadcastInfo, MeshConfig, MeshCore};
pub use protocol::{Direction, MeshEvent, MessageId, Progress};
pub use reassembly::{MessageState, ReassemblyEvent, ReassemblyTable};
pub use scheduler::{BroadcastQueue, ScheduledFrame};
pub use wire::{decode_frame, Codec, DecodedFrame, EncodeError, Frame};

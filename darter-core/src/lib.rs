//! Core command and routing abstractions shared by the transaction layer.

pub mod command;
pub mod containers;
pub mod registry;
pub mod sharding;
pub mod status;

pub use command::{CommandFrame, CommandId};
pub use registry::CommandRegistry;
pub use sharding::shard_of;
pub use status::{OpResult, OpStatus};

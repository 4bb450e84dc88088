//! Channel layer: per-queue consumers and the shared publish channel.

pub mod consume;
pub mod publish;
pub mod shutdown;

pub use consume::ConsumeChannel;
pub use publish::PublishChannel;
pub use shutdown::ShutdownPolicy;

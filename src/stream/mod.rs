//! Stream pipelines and lifecycle management

mod manager;
mod receiver;
mod transmitter;

pub use manager::{StreamCallback, StreamManager};
pub use receiver::RtpReceiver;
pub use transmitter::RtpTransmitter;

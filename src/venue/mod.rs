pub mod client;
pub mod error;
pub mod messages;
pub mod stream;
pub mod transport;

pub mod client;
pub mod error;
pub mod hub;
pub mod room;

pub use client::serve;
pub use error::GatewayError;
pub use hub::Hub;
pub use room::{Member, Payload, Room};

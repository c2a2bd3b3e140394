//! Serverless peer-to-peer chat. Two peers trade a base64 offer token and a
//! base64 answer token out of band, after which text and images flow over a
//! single WebRTC data channel.

pub mod attachment;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{ConnectionSession, ConnectionState, Delivery, SessionUpdate};

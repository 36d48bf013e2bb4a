pub mod batch;
pub mod connection;
pub mod encoding;
pub mod gate;
pub mod monitor;
pub mod observer;
pub mod record;
pub mod register;
pub mod service;
pub mod span;

pub use connection::{Connection, Transport, TransportError};
pub use encoding::WordOrder;
pub use observer::{Change, Observer};
pub use register::*;
pub use service::*;

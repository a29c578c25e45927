pub mod error;
pub mod handler;
pub mod handshake;
pub mod host;
pub mod message;
pub mod picker;
pub mod registry;
pub mod worker;

// Re-export common types
pub use error::{HandshakeError, ProtocolError};
pub use handler::{HandlerEvent, MessageHandler};
pub use host::Host;
pub use message::{MessageType, NetworkMessage};
pub use picker::{ClientPicker, FirstIdlePicker, LeastLoadedPicker};
pub use registry::{ClientEvent, ClientInfo, ClientRegistry};
pub use worker::{HostCommand, WorkerConnection};

pub mod gateway;
pub mod message;
pub mod protocol;
pub mod session;

pub use gateway::{GatewayConfig, GatewayRecord, GatewaySnapshot};
pub use message::{ContentBlock, Message, MessageRole};
pub use protocol::{
    ChatEventPayload, ChatState, ConnectParams, ConnectPayload, Frame, Snapshot, WireError,
};
pub use session::{FederatedSession, FederatedTarget, Session};

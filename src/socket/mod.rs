//! Auto-reconnecting WebSocket and its lifecycle binding

pub mod binding;
pub mod provider;
pub mod reconnecting;

pub use binding::{BindingOptions, SocketBinding};
pub use provider::{is_private_host, normalize_ws_url, ProtocolsProvider, UrlProvider};
pub use reconnecting::{
    ReconnectingSocket, SocketEvent, SocketMessage, SocketOptions, SocketState,
};

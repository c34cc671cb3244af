pub mod websocket;

pub use websocket::{WebSocketRelay, room_url};

mod handler;
mod message;

pub use handler::{handle_control_text, is_valid_room_name, ws_handler};
pub use message::{ClientMessage, ControlMessageError, MessageType, OutboundFrame, ServerMessage};

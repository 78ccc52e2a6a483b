#![forbid(unsafe_code)]

pub mod codec;
pub mod directive;
pub mod event;

pub use codec::{ClientCommand, CodecError, decode_binary, decode_text};
pub use directive::{ControlDirective, parse_directive};
pub use event::{ServerEvent, encode_event};

/// Protocol identifiers.
pub mod version {
	/// Application sub-protocol negotiated at connection establishment (v1).
	pub const SUBPROTOCOL: &str = "courtside.v1";
}

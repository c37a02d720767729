//! The CoAP wire codec: message framing and the typed option model.

pub mod header;
pub mod option;
pub mod packet;

pub use header::{Header, MessageClass, MessageType, RequestType, ResponseType};
pub use option::{codes, BlockValue, CoapOption, OptionDef, OptionValue, ValueFormat};
pub use packet::{ContentFormat, ObserveOption, Packet};

use thiserror::Error;

/// Errors raised while decoding a raw datagram.
///
/// A parse failure is fatal to the single datagram it came from; the
/// client drops the datagram and keeps every other exchange running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short for the fixed header")]
    InvalidHeader,
    #[error("token truncated by end of datagram")]
    InvalidTokenLength,
    #[error("reserved option delta nibble 15")]
    InvalidOptionDelta,
    #[error("reserved or truncated option length")]
    InvalidOptionLength,
    #[error("option value rejected: {0}")]
    InvalidOptionValue(#[from] OptionError),
}

/// Errors raised when constructing a typed option value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option code {0} is not registered")]
    UnknownOption(u16),
    #[error("{name}: minimal encoding of {value} exceeds {max} bytes")]
    ValueTooLarge {
        name: &'static str,
        value: u64,
        max: usize,
    },
    #[error("{name}: value length {len} outside {min}..={max}")]
    ValueOutOfBounds {
        name: &'static str,
        len: usize,
        min: usize,
        max: usize,
    },
    #[error("{0}: value is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("{0}: wrong value kind for this option")]
    WrongValueKind(&'static str),
    #[error("block size exponent {0} out of range 0..=6")]
    InvalidSizeExponent(u8),
    #[error("block field value {0:#x} does not fit the 24-bit encoding")]
    BlockOverflow(u32),
}

/// Errors surfaced to callers of the client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid CoAP url: {0}")]
    InvalidUrl(String),
    #[error("no security parameters registered for {0}")]
    NoSecurityParameters(String),
    #[error("peer reset the exchange")]
    PeerReset,
    #[error("confirmable message retransmission exhausted")]
    RetransmissionExhausted,
    #[error("exchange cancelled before completion")]
    Cancelled,
    #[error("malformed message: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

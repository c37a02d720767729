use std::fmt;

/// The four byte fixed header of every CoAP message.
///
/// Version, type and token length share the first byte; the raw byte is
/// kept as-is so that even non-compliant version values survive a
/// decode/encode round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    ver_type_tkl: u8,
    pub code: MessageClass,
    message_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Empty,
    Request(RequestType),
    Response(ResponseType),
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    // 2.xx
    Created,
    Deleted,
    Valid,
    Changed,
    Content,

    // 4.xx
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,

    // 5.xx
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,
}

impl Default for Header {
    fn default() -> Header {
        Header {
            ver_type_tkl: 0,
            code: MessageClass::Empty,
            message_id: 0,
        }
    }
}

impl Header {
    pub fn new() -> Header {
        Default::default()
    }

    pub(crate) fn from_bytes(buf: &[u8; 4]) -> Header {
        Header {
            ver_type_tkl: buf[0],
            code: MessageClass::from(buf[1]),
            message_id: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; 4] {
        let id = self.message_id.to_be_bytes();
        [self.ver_type_tkl, u8::from(self.code), id[0], id[1]]
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.ver_type_tkl = v << 6 | (0x3F & self.ver_type_tkl);
    }

    #[inline]
    pub fn get_version(&self) -> u8 {
        self.ver_type_tkl >> 6
    }

    #[inline]
    pub fn set_type(&mut self, t: MessageType) {
        let tn = match t {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        };
        self.ver_type_tkl = tn << 4 | (0xCF & self.ver_type_tkl);
    }

    #[inline]
    pub fn get_type(&self) -> MessageType {
        match (0x30 & self.ver_type_tkl) >> 4 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    #[inline]
    pub(crate) fn set_token_length(&mut self, tkl: u8) {
        debug_assert_eq!(0xF0 & tkl, 0);
        self.ver_type_tkl = tkl | (0xF0 & self.ver_type_tkl);
    }

    #[inline]
    pub fn get_token_length(&self) -> u8 {
        0x0F & self.ver_type_tkl
    }

    #[inline]
    pub fn set_message_id(&mut self, message_id: u16) {
        self.message_id = message_id;
    }

    #[inline]
    pub fn get_message_id(&self) -> u16 {
        self.message_id
    }
}

impl From<u8> for MessageClass {
    fn from(code: u8) -> MessageClass {
        match code {
            0x00 => MessageClass::Empty,

            0x01 => MessageClass::Request(RequestType::Get),
            0x02 => MessageClass::Request(RequestType::Post),
            0x03 => MessageClass::Request(RequestType::Put),
            0x04 => MessageClass::Request(RequestType::Delete),

            0x41 => MessageClass::Response(ResponseType::Created),
            0x42 => MessageClass::Response(ResponseType::Deleted),
            0x43 => MessageClass::Response(ResponseType::Valid),
            0x44 => MessageClass::Response(ResponseType::Changed),
            0x45 => MessageClass::Response(ResponseType::Content),

            0x80 => MessageClass::Response(ResponseType::BadRequest),
            0x81 => MessageClass::Response(ResponseType::Unauthorized),
            0x82 => MessageClass::Response(ResponseType::BadOption),
            0x83 => MessageClass::Response(ResponseType::Forbidden),
            0x84 => MessageClass::Response(ResponseType::NotFound),
            0x85 => MessageClass::Response(ResponseType::MethodNotAllowed),
            0x86 => MessageClass::Response(ResponseType::NotAcceptable),
            0x8C => MessageClass::Response(ResponseType::PreconditionFailed),
            0x8D => MessageClass::Response(ResponseType::RequestEntityTooLarge),
            0x8F => MessageClass::Response(ResponseType::UnsupportedContentFormat),

            0x90 => MessageClass::Response(ResponseType::InternalServerError),
            0x91 => MessageClass::Response(ResponseType::NotImplemented),
            0x92 => MessageClass::Response(ResponseType::BadGateway),
            0x93 => MessageClass::Response(ResponseType::ServiceUnavailable),
            0x94 => MessageClass::Response(ResponseType::GatewayTimeout),
            0x95 => MessageClass::Response(ResponseType::ProxyingNotSupported),

            n => MessageClass::Reserved(n),
        }
    }
}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> u8 {
        match class {
            MessageClass::Empty => 0x00,

            MessageClass::Request(RequestType::Get) => 0x01,
            MessageClass::Request(RequestType::Post) => 0x02,
            MessageClass::Request(RequestType::Put) => 0x03,
            MessageClass::Request(RequestType::Delete) => 0x04,

            MessageClass::Response(ResponseType::Created) => 0x41,
            MessageClass::Response(ResponseType::Deleted) => 0x42,
            MessageClass::Response(ResponseType::Valid) => 0x43,
            MessageClass::Response(ResponseType::Changed) => 0x44,
            MessageClass::Response(ResponseType::Content) => 0x45,

            MessageClass::Response(ResponseType::BadRequest) => 0x80,
            MessageClass::Response(ResponseType::Unauthorized) => 0x81,
            MessageClass::Response(ResponseType::BadOption) => 0x82,
            MessageClass::Response(ResponseType::Forbidden) => 0x83,
            MessageClass::Response(ResponseType::NotFound) => 0x84,
            MessageClass::Response(ResponseType::MethodNotAllowed) => 0x85,
            MessageClass::Response(ResponseType::NotAcceptable) => 0x86,
            MessageClass::Response(ResponseType::PreconditionFailed) => 0x8C,
            MessageClass::Response(ResponseType::RequestEntityTooLarge) => 0x8D,
            MessageClass::Response(ResponseType::UnsupportedContentFormat) => 0x8F,

            MessageClass::Response(ResponseType::InternalServerError) => 0x90,
            MessageClass::Response(ResponseType::NotImplemented) => 0x91,
            MessageClass::Response(ResponseType::BadGateway) => 0x92,
            MessageClass::Response(ResponseType::ServiceUnavailable) => 0x93,
            MessageClass::Response(ResponseType::GatewayTimeout) => 0x94,
            MessageClass::Response(ResponseType::ProxyingNotSupported) => 0x95,

            MessageClass::Reserved(n) => n,
        }
    }
}

impl MessageClass {
    /// True for class 0 with detail 1..=31.
    pub fn is_request(&self) -> bool {
        let code = u8::from(*self);
        code >> 5 == 0 && (1..=31).contains(&(code & 0x1F))
    }

    /// True for class 2, 4 or 5.
    pub fn is_response(&self) -> bool {
        matches!(u8::from(*self) >> 5, 2 | 4 | 5)
    }

    pub fn is_empty(&self) -> bool {
        u8::from(*self) == 0
    }
}

impl fmt::Display for MessageClass {
    /// The RFC 7252 `class.detail` form, e.g. `2.05`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = u8::from(*self);
        write!(f, "{}.{:02}", code >> 5, code & 0x1F)
    }
}

//! Parsing and serialization of whole CoAP messages (RFC 7252 §3).

use crate::error::{OptionError, ParseError};

use super::header::Header;
use super::option::{codes, CoapOption};

/// Marker separating the option list from the payload.
const PAYLOAD_MARKER: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
    ApplicationSenmlJSON = 110,
    ApplicationSensmlJSON = 111,
    ApplicationSenmlCBOR = 112,
    ApplicationSensmlCBOR = 113,
    ApplicationSenmlExi = 114,
    ApplicationSensmlExi = 115,
    ApplicationSenmlXML = 310,
    ApplicationSensmlXML = 311,
}

impl TryFrom<u16> for ContentFormat {
    type Error = u16;

    fn try_from(number: u16) -> Result<ContentFormat, u16> {
        match number {
            0 => Ok(ContentFormat::TextPlain),
            40 => Ok(ContentFormat::ApplicationLinkFormat),
            41 => Ok(ContentFormat::ApplicationXML),
            42 => Ok(ContentFormat::ApplicationOctetStream),
            47 => Ok(ContentFormat::ApplicationEXI),
            50 => Ok(ContentFormat::ApplicationJSON),
            60 => Ok(ContentFormat::ApplicationCBOR),
            110 => Ok(ContentFormat::ApplicationSenmlJSON),
            111 => Ok(ContentFormat::ApplicationSensmlJSON),
            112 => Ok(ContentFormat::ApplicationSenmlCBOR),
            113 => Ok(ContentFormat::ApplicationSensmlCBOR),
            114 => Ok(ContentFormat::ApplicationSenmlExi),
            115 => Ok(ContentFormat::ApplicationSensmlExi),
            310 => Ok(ContentFormat::ApplicationSenmlXML),
            311 => Ok(ContentFormat::ApplicationSensmlXML),
            n => Err(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOption {
    Register = 0,
    Deregister = 1,
}

/// A structured CoAP message: fixed header, token, options in ascending
/// code order, payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    pub header: Header,
    token: Vec<u8>,
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new() -> Packet {
        Default::default()
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.header.set_token_length(token.len() as u8);
        self.token = token;
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    /// Append an option, keeping the list sorted by code. Repeated codes
    /// keep their insertion order.
    pub fn add_option(&mut self, option: CoapOption) {
        let at = self.options.partition_point(|o| o.code() <= option.code());
        self.options.insert(at, option);
    }

    /// Replace any existing instances of the option's code.
    pub fn set_option(&mut self, option: CoapOption) {
        self.clear_option(option.code());
        self.add_option(option);
    }

    pub fn clear_option(&mut self, code: u16) {
        self.options.retain(|o| o.code() != code);
    }

    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    pub fn get_options(&self, code: u16) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.code() == code)
    }

    pub fn get_first_option(&self, code: u16) -> Option<&CoapOption> {
        self.get_options(code).next()
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        // two bytes always fit the Content-Format bound
        let option = CoapOption::uint(codes::CONTENT_FORMAT, cf as u64).unwrap();
        self.set_option(option);
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        let value = self.get_first_option(codes::CONTENT_FORMAT)?.uint_value()?;
        let number = u16::try_from(value).ok()?;
        ContentFormat::try_from(number).ok()
    }

    pub fn set_observe(&mut self, value: u64) -> Result<(), OptionError> {
        let option = CoapOption::uint(codes::OBSERVE, value)?;
        self.set_option(option);
        Ok(())
    }

    pub fn get_observe(&self) -> Option<u64> {
        self.get_first_option(codes::OBSERVE)?.uint_value()
    }

    /// Decodes a byte slice and constructs the equivalent Packet.
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, ParseError> {
        if buf.len() < 4 {
            return Err(ParseError::InvalidHeader);
        }
        let header = Header::from_bytes(&[buf[0], buf[1], buf[2], buf[3]]);

        let token_length = header.get_token_length() as usize;
        let options_start = 4 + token_length;
        if options_start > buf.len() {
            return Err(ParseError::InvalidTokenLength);
        }
        let token = buf[4..options_start].to_vec();

        let mut pos = options_start;
        let mut prev_code = 0u16;
        let mut options = Vec::new();
        while pos < buf.len() && buf[pos] != PAYLOAD_MARKER {
            let option = CoapOption::decode_from(buf, &mut pos, prev_code)?;
            prev_code = option.code();
            options.push(option);
        }

        // A marker with nothing after it is non-compliant input; treat
        // it as an empty payload.
        let payload = if pos < buf.len() {
            buf[pos + 1..].to_vec()
        } else {
            Vec::new()
        };

        Ok(Packet {
            header,
            token,
            options,
            payload,
        })
    }

    /// Returns the wire form of the Packet. The payload marker is
    /// omitted entirely when the payload is empty.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.token);

        let mut prev_code = 0u16;
        for option in &self.options {
            option.encode_into(prev_code, &mut buf);
            prev_code = option.code();
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        buf
    }
}

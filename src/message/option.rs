//! The CoAP option catalog and the delta-encoded TLV wire form.
//!
//! Every registered option carries a value of one of four kinds: an
//! unsigned integer of bounded minimal length, an opaque byte string, a
//! UTF-8 string, or the packed block-transfer value of RFC 7959. The
//! catalog is a closed, compile-time table; unregistered codes are
//! rejected while decoding.

use crate::error::{OptionError, ParseError};

pub mod codes {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const IF_NONE_MATCH: u16 = 5;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
    pub const SIZE2: u16 = 28;
    pub const PROXY_URI: u16 = 35;
    pub const PROXY_SCHEME: u16 = 39;
    pub const SIZE1: u16 = 60;
}

/// Value kind and length bounds for one registered option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Uint { max: usize },
    Opaque { min: usize, max: usize },
    Str { min: usize, max: usize },
    Block,
}

#[derive(Debug, PartialEq, Eq)]
pub struct OptionDef {
    pub code: u16,
    pub name: &'static str,
    pub repeatable: bool,
    pub format: ValueFormat,
}

const fn uint(code: u16, name: &'static str, max: usize) -> OptionDef {
    OptionDef {
        code,
        name,
        repeatable: false,
        format: ValueFormat::Uint { max },
    }
}

const fn opaque(code: u16, name: &'static str, repeatable: bool, min: usize, max: usize) -> OptionDef {
    OptionDef {
        code,
        name,
        repeatable,
        format: ValueFormat::Opaque { min, max },
    }
}

const fn string(code: u16, name: &'static str, repeatable: bool, min: usize, max: usize) -> OptionDef {
    OptionDef {
        code,
        name,
        repeatable,
        format: ValueFormat::Str { min, max },
    }
}

const fn block(code: u16, name: &'static str) -> OptionDef {
    OptionDef {
        code,
        name,
        repeatable: false,
        format: ValueFormat::Block,
    }
}

/// The full registry, in ascending code order.
pub const REGISTRY: [OptionDef; 19] = [
    opaque(codes::IF_MATCH, "If-Match", true, 0, 8),
    string(codes::URI_HOST, "Uri-Host", false, 1, 255),
    opaque(codes::ETAG, "ETag", true, 1, 8),
    opaque(codes::IF_NONE_MATCH, "If-None-Match", false, 0, 0),
    uint(codes::OBSERVE, "Observe", 3),
    uint(codes::URI_PORT, "Uri-Port", 2),
    string(codes::LOCATION_PATH, "Location-Path", true, 0, 255),
    string(codes::URI_PATH, "Uri-Path", true, 0, 255),
    uint(codes::CONTENT_FORMAT, "Content-Format", 2),
    uint(codes::MAX_AGE, "Max-Age", 4),
    string(codes::URI_QUERY, "Uri-Query", true, 0, 255),
    uint(codes::ACCEPT, "Accept", 2),
    string(codes::LOCATION_QUERY, "Location-Query", true, 0, 255),
    block(codes::BLOCK2, "Block2"),
    block(codes::BLOCK1, "Block1"),
    uint(codes::SIZE2, "Size2", 4),
    string(codes::PROXY_URI, "Proxy-Uri", false, 1, 1034),
    string(codes::PROXY_SCHEME, "Proxy-Scheme", false, 1, 255),
    uint(codes::SIZE1, "Size1", 4),
];

impl OptionDef {
    pub fn by_code(code: u16) -> Option<&'static OptionDef> {
        REGISTRY.iter().find(|def| def.code == code)
    }

    pub fn by_name(name: &str) -> Option<&'static OptionDef> {
        REGISTRY.iter().find(|def| def.name == name)
    }
}

/// The packed 24-bit block-transfer value: high bits are the block
/// number, bit 3 the more-blocks flag, bits 0..=2 the size exponent
/// (block size = 2^(4+exp)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockValue {
    raw: u32,
}

impl BlockValue {
    pub fn new(block_number: u32, more: bool, size_exponent: u8) -> Result<BlockValue, OptionError> {
        if size_exponent > 6 {
            return Err(OptionError::InvalidSizeExponent(size_exponent));
        }
        if block_number > 0x000F_FFFF {
            return Err(OptionError::BlockOverflow(block_number));
        }
        Ok(BlockValue {
            raw: block_number << 4 | u32::from(more) << 3 | u32::from(size_exponent),
        })
    }

    /// Wire-decoded scalar; exponent 7 is structurally accepted here and
    /// only rejected by the setter.
    pub fn from_scalar(raw: u32) -> Result<BlockValue, OptionError> {
        if raw > 0x00FF_FFFF {
            return Err(OptionError::BlockOverflow(raw));
        }
        Ok(BlockValue { raw })
    }

    pub fn scalar(&self) -> u32 {
        self.raw
    }

    pub fn size_exponent(&self) -> u8 {
        (self.raw & 0x7) as u8
    }

    pub fn set_size_exponent(&mut self, exp: u8) -> Result<(), OptionError> {
        if exp > 6 {
            return Err(OptionError::InvalidSizeExponent(exp));
        }
        self.raw = self.raw & !0x7 | u32::from(exp);
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        1 << (4 + self.size_exponent())
    }

    pub fn more_blocks(&self) -> bool {
        self.raw >> 3 & 0x1 == 0x1
    }

    pub fn set_more_blocks(&mut self, more: bool) {
        self.raw = self.raw & !0x8 | u32::from(more) << 3;
    }

    pub fn is_last_block(&self) -> bool {
        !self.more_blocks()
    }

    pub fn block_number(&self) -> u32 {
        self.raw >> 4
    }

    pub fn set_block_number(&mut self, number: u32) -> Result<(), OptionError> {
        if number > 0x000F_FFFF {
            return Err(OptionError::BlockOverflow(number));
        }
        self.raw = self.raw & 0xF | number << 4;
        Ok(())
    }

    pub fn byte_offset(&self) -> usize {
        self.block_number() as usize * self.block_size()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Uint(u64),
    Opaque(Vec<u8>),
    Str(String),
    Block(BlockValue),
}

/// One typed option instance tied to its registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapOption {
    def: &'static OptionDef,
    value: OptionValue,
}

fn uint_len(value: u64) -> usize {
    ((u64::BITS - value.leading_zeros() + 7) / 8) as usize
}

fn uint_bytes(value: u64) -> Vec<u8> {
    let len = uint_len(value);
    value.to_be_bytes()[8 - len..].to_vec()
}

impl CoapOption {
    fn lookup(code: u16) -> Result<&'static OptionDef, OptionError> {
        OptionDef::by_code(code).ok_or(OptionError::UnknownOption(code))
    }

    /// Build a numeric option; the minimal big-endian encoding of
    /// `value` must fit the option's byte bound.
    pub fn uint(code: u16, value: u64) -> Result<CoapOption, OptionError> {
        let def = Self::lookup(code)?;
        let ValueFormat::Uint { max } = def.format else {
            return Err(OptionError::WrongValueKind(def.name));
        };
        if uint_len(value) > max {
            return Err(OptionError::ValueTooLarge {
                name: def.name,
                value,
                max,
            });
        }
        Ok(CoapOption {
            def,
            value: OptionValue::Uint(value),
        })
    }

    pub fn opaque(code: u16, value: Vec<u8>) -> Result<CoapOption, OptionError> {
        let def = Self::lookup(code)?;
        let ValueFormat::Opaque { min, max } = def.format else {
            return Err(OptionError::WrongValueKind(def.name));
        };
        if value.len() < min || value.len() > max {
            return Err(OptionError::ValueOutOfBounds {
                name: def.name,
                len: value.len(),
                min,
                max,
            });
        }
        Ok(CoapOption {
            def,
            value: OptionValue::Opaque(value),
        })
    }

    pub fn string(code: u16, value: impl Into<String>) -> Result<CoapOption, OptionError> {
        let def = Self::lookup(code)?;
        let ValueFormat::Str { min, max } = def.format else {
            return Err(OptionError::WrongValueKind(def.name));
        };
        let value = value.into();
        if value.len() < min || value.len() > max {
            return Err(OptionError::ValueOutOfBounds {
                name: def.name,
                len: value.len(),
                min,
                max,
            });
        }
        Ok(CoapOption {
            def,
            value: OptionValue::Str(value),
        })
    }

    pub fn block(code: u16, value: BlockValue) -> Result<CoapOption, OptionError> {
        let def = Self::lookup(code)?;
        if def.format != ValueFormat::Block {
            return Err(OptionError::WrongValueKind(def.name));
        }
        Ok(CoapOption {
            def,
            value: OptionValue::Block(value),
        })
    }

    /// Typed decode of a raw option value as found on the wire.
    pub fn from_raw(code: u16, raw: &[u8]) -> Result<CoapOption, OptionError> {
        let def = Self::lookup(code)?;
        let value = match def.format {
            ValueFormat::Uint { max } => {
                if raw.len() > max {
                    return Err(OptionError::ValueOutOfBounds {
                        name: def.name,
                        len: raw.len(),
                        min: 0,
                        max,
                    });
                }
                OptionValue::Uint(raw.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b)))
            }
            ValueFormat::Opaque { min, max } => {
                if raw.len() < min || raw.len() > max {
                    return Err(OptionError::ValueOutOfBounds {
                        name: def.name,
                        len: raw.len(),
                        min,
                        max,
                    });
                }
                OptionValue::Opaque(raw.to_vec())
            }
            ValueFormat::Str { min, max } => {
                if raw.len() < min || raw.len() > max {
                    return Err(OptionError::ValueOutOfBounds {
                        name: def.name,
                        len: raw.len(),
                        min,
                        max,
                    });
                }
                let s = std::str::from_utf8(raw).map_err(|_| OptionError::InvalidUtf8(def.name))?;
                OptionValue::Str(s.to_string())
            }
            ValueFormat::Block => {
                if raw.len() > 3 {
                    return Err(OptionError::ValueOutOfBounds {
                        name: def.name,
                        len: raw.len(),
                        min: 0,
                        max: 3,
                    });
                }
                let scalar = raw.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b));
                OptionValue::Block(BlockValue::from_scalar(scalar)?)
            }
        };
        Ok(CoapOption { def, value })
    }

    pub fn code(&self) -> u16 {
        self.def.code
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }

    pub fn repeatable(&self) -> bool {
        self.def.repeatable
    }

    pub fn is_critical(&self) -> bool {
        self.def.code & 0x1 == 0x1
    }

    pub fn is_unsafe(&self) -> bool {
        self.def.code & 0x2 == 0x2
    }

    pub fn is_no_cache_key(&self) -> bool {
        self.def.code & 0x1C == 0x1C
    }

    pub fn value(&self) -> &OptionValue {
        &self.value
    }

    pub fn uint_value(&self) -> Option<u64> {
        match self.value {
            OptionValue::Uint(v) => Some(v),
            _ => None,
        }
    }

    pub fn str_value(&self) -> Option<&str> {
        match &self.value {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn opaque_value(&self) -> Option<&[u8]> {
        match &self.value {
            OptionValue::Opaque(v) => Some(v),
            _ => None,
        }
    }

    pub fn block_value(&self) -> Option<BlockValue> {
        match self.value {
            OptionValue::Block(b) => Some(b),
            _ => None,
        }
    }

    /// Canonical raw value bytes (numeric values in minimal length).
    pub fn value_bytes(&self) -> Vec<u8> {
        match &self.value {
            OptionValue::Uint(v) => uint_bytes(*v),
            OptionValue::Opaque(v) => v.clone(),
            OptionValue::Str(s) => s.as_bytes().to_vec(),
            OptionValue::Block(b) => uint_bytes(u64::from(b.scalar())),
        }
    }

    /// Serialize the TLV form given the code of the immediately
    /// preceding option (0 for the first one). Only reachable through
    /// `Packet`, whose option list stays in ascending code order, so
    /// the delta can never go negative.
    pub(crate) fn encode_into(&self, prev_code: u16, buf: &mut Vec<u8>) {
        debug_assert!(self.def.code >= prev_code);
        let raw = self.value_bytes();
        let delta = usize::from(self.def.code - prev_code);

        buf.push(ext_nibble(delta) << 4 | ext_nibble(raw.len()));
        push_ext(buf, delta);
        push_ext(buf, raw.len());
        buf.extend_from_slice(&raw);
    }

    /// Decode one TLV entry starting at `pos`, advancing it past the
    /// consumed bytes.
    pub fn decode_from(buf: &[u8], pos: &mut usize, prev_code: u16) -> Result<CoapOption, ParseError> {
        let byte = buf[*pos];
        *pos += 1;

        let delta = read_ext(buf, pos, byte >> 4, ParseError::InvalidOptionDelta)?;
        let length = read_ext(buf, pos, byte & 0xF, ParseError::InvalidOptionLength)?;

        let code = u32::from(prev_code) + delta as u32;
        let code = u16::try_from(code).map_err(|_| ParseError::InvalidOptionDelta)?;

        let end = *pos + length;
        if end > buf.len() {
            return Err(ParseError::InvalidOptionLength);
        }
        let raw = &buf[*pos..end];
        *pos = end;

        Ok(CoapOption::from_raw(code, raw)?)
    }
}

fn ext_nibble(value: usize) -> u8 {
    if value <= 12 {
        value as u8
    } else if value < 269 {
        13
    } else {
        14
    }
}

fn push_ext(buf: &mut Vec<u8>, value: usize) {
    if value <= 12 {
        // encoded entirely in the nibble
    } else if value < 269 {
        buf.push((value - 13) as u8);
    } else {
        let fix = (value - 269) as u16;
        buf.push((fix >> 8) as u8);
        buf.push((fix & 0xFF) as u8);
    }
}

fn read_ext(buf: &[u8], pos: &mut usize, nibble: u8, reserved: ParseError) -> Result<usize, ParseError> {
    match nibble {
        13 => {
            if *pos >= buf.len() {
                return Err(ParseError::InvalidOptionLength);
            }
            let v = buf[*pos] as usize + 13;
            *pos += 1;
            Ok(v)
        }
        14 => {
            if *pos + 1 >= buf.len() {
                return Err(ParseError::InvalidOptionLength);
            }
            let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize + 269;
            *pos += 2;
            Ok(v)
        }
        15 => Err(reserved),
        n => Ok(n as usize),
    }
}

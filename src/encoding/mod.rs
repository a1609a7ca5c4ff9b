//! BACnet Encoding/Decoding Module
//!
//! Tag-level codec for the primitive values carried in service requests and
//! acknowledgements (ASHRAE 135 clause 20.2).
//!
//! # Overview
//!
//! Every encoded value starts with a tag octet holding the tag number, the
//! class (application or context-specific) and a length/value/type field.
//! Application tags identify the datatype; context tags identify a field by
//! position inside a service production and are only meaningful together with
//! the service grammar. Constructed fields are bracketed by opening and
//! closing tags.
//!
//! Encoders append to a `Vec<u8>`; the caller copies the finished production
//! into a bounded [`BacnetBuf`](crate::buffer::BacnetBuf), which is where the
//! maximum APDU size is enforced. Decoders take a slice and return the value
//! with the number of bytes consumed.
//!
//! # Example
//!
//! ```
//! use bacnet_session::encoding::*;
//!
//! let mut buffer = Vec::new();
//! encode_context_unsigned(&mut buffer, 0, 1234).unwrap();
//! let (value, consumed) = decode_context_unsigned(&buffer, 0).unwrap();
//! assert_eq!((value, consumed), (1234, 3));
//! ```

use thiserror::Error;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("buffer underflow during decoding")]
    BufferUnderflow,
    #[error("invalid tag number encountered")]
    InvalidTag,
    #[error("expected context tag {expected}")]
    UnexpectedTag { expected: u8 },
    #[error("invalid length value")]
    InvalidLength,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("value out of valid range")]
    ValueOutOfRange,
}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            _ => Err(EncodingError::InvalidTag),
        }
    }
}

/// Decoded tag octet(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub kind: TagKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Primitive value of this many content octets (or the boolean value
    /// itself for application tag 1).
    Value(usize),
    Opening,
    Closing,
}

impl Tag {
    /// Content octets following the tag header.
    pub fn content_len(&self) -> usize {
        match self.kind {
            TagKind::Value(len) if self.context || self.number != ApplicationTag::Boolean as u8 => len,
            _ => 0,
        }
    }

    pub fn is_opening(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Opening
    }

    pub fn is_closing(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Closing
    }
}

fn encode_tag(buffer: &mut Vec<u8>, number: u8, context: bool, length: usize) -> Result<()> {
    let class = if context { 0x08 } else { 0x00 };
    let lvt = if length < 5 { length as u8 } else { 5 };

    if number <= 14 {
        buffer.push((number << 4) | class | lvt);
    } else {
        buffer.push(0xF0 | class | lvt);
        buffer.push(number);
    }

    if length >= 5 {
        if length < 254 {
            buffer.push(length as u8);
        } else if length < 65536 {
            buffer.push(254);
            buffer.extend_from_slice(&(length as u16).to_be_bytes());
        } else if length <= u32::MAX as usize {
            buffer.push(255);
            buffer.extend_from_slice(&(length as u32).to_be_bytes());
        } else {
            return Err(EncodingError::ValueOutOfRange);
        }
    }

    Ok(())
}

/// Decode any tag header.
pub fn decode_tag(data: &[u8]) -> Result<(Tag, usize)> {
    let first = *data.first().ok_or(EncodingError::BufferUnderflow)?;
    let context = first & 0x08 != 0;
    let lvt = first & 0x07;
    let mut consumed = 1;

    let number = if first >> 4 == 0x0F {
        let extended = *data.get(1).ok_or(EncodingError::BufferUnderflow)?;
        consumed += 1;
        extended
    } else {
        first >> 4
    };

    let kind = match lvt {
        6 if context => TagKind::Opening,
        7 if context => TagKind::Closing,
        5 => {
            let len_byte = *data.get(consumed).ok_or(EncodingError::BufferUnderflow)?;
            consumed += 1;
            let length = match len_byte {
                254 => {
                    let bytes = data
                        .get(consumed..consumed + 2)
                        .ok_or(EncodingError::BufferUnderflow)?;
                    consumed += 2;
                    u16::from_be_bytes([bytes[0], bytes[1]]) as usize
                }
                255 => {
                    let bytes = data
                        .get(consumed..consumed + 4)
                        .ok_or(EncodingError::BufferUnderflow)?;
                    consumed += 4;
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                short => short as usize,
            };
            TagKind::Value(length)
        }
        short => TagKind::Value(short as usize),
    };

    Ok((Tag { number, context, kind }, consumed))
}

/// Encode a BACnet application tag
pub fn encode_application_tag(buffer: &mut Vec<u8>, tag: ApplicationTag, length: usize) -> Result<()> {
    encode_tag(buffer, tag as u8, false, length)
}

/// Decode a BACnet application tag, returning `(tag, length, header octets)`
pub fn decode_application_tag(data: &[u8]) -> Result<(ApplicationTag, usize, usize)> {
    let (tag, consumed) = decode_tag(data)?;
    if tag.context {
        return Err(EncodingError::InvalidTag);
    }
    let length = match tag.kind {
        TagKind::Value(length) => length,
        _ => return Err(EncodingError::InvalidTag),
    };
    Ok((ApplicationTag::try_from(tag.number)?, length, consumed))
}

/// Encode an opening tag for constructed data
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange);
    }
    buffer.push((tag_number << 4) | 0x0E);
    Ok(())
}

/// Encode a closing tag for constructed data
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) -> Result<()> {
    if tag_number > 14 {
        return Err(EncodingError::ValueOutOfRange);
    }
    buffer.push((tag_number << 4) | 0x0F);
    Ok(())
}

/// Whether `data` starts with a primitive context tag numbered `tag_number`.
pub fn has_context_tag(data: &[u8], tag_number: u8) -> bool {
    matches!(
        decode_tag(data),
        Ok((Tag { number, context: true, kind: TagKind::Value(_) }, _)) if number == tag_number
    )
}

pub fn is_opening_tag(data: &[u8], tag_number: u8) -> bool {
    matches!(decode_tag(data), Ok((tag, _)) if tag.is_opening(tag_number))
}

pub fn is_closing_tag(data: &[u8], tag_number: u8) -> bool {
    matches!(decode_tag(data), Ok((tag, _)) if tag.is_closing(tag_number))
}

/// Returns the octets enclosed by the opening/closing pair `tag_number` at the
/// start of `data`, and the total octets consumed including both tags.
pub fn extract_constructed(data: &[u8], tag_number: u8) -> Result<(&[u8], usize)> {
    let (open, header) = decode_tag(data)?;
    if !open.is_opening(tag_number) {
        return Err(EncodingError::UnexpectedTag { expected: tag_number });
    }

    let mut pos = header;
    let mut depth = 0usize;
    while pos < data.len() {
        let (tag, len) = decode_tag(&data[pos..])?;
        match tag.kind {
            TagKind::Opening => depth += 1,
            TagKind::Closing if depth == 0 => {
                if !tag.is_closing(tag_number) {
                    return Err(EncodingError::UnexpectedTag { expected: tag_number });
                }
                return Ok((&data[header..pos], pos + len));
            }
            TagKind::Closing => depth -= 1,
            TagKind::Value(_) => {}
        }
        pos += len + tag.content_len();
    }

    Err(EncodingError::BufferUnderflow)
}

/// Total octets of the element (primitive value or complete constructed
/// production) at the start of `data`.
pub fn element_len(data: &[u8]) -> Result<usize> {
    let (tag, header) = decode_tag(data)?;
    match tag.kind {
        TagKind::Opening => extract_constructed(data, tag.number).map(|(_, len)| len),
        TagKind::Closing => Err(EncodingError::InvalidTag),
        TagKind::Value(_) => {
            let total = header + tag.content_len();
            if total > data.len() {
                return Err(EncodingError::BufferUnderflow);
            }
            Ok(total)
        }
    }
}

fn unsigned_octets(value: u32) -> ([u8; 4], usize) {
    let bytes = value.to_be_bytes();
    let len = match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };
    (bytes, len)
}

fn decode_unsigned_octets(octets: &[u8]) -> Result<u32> {
    if octets.is_empty() || octets.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    Ok(octets.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Content octets of a primitive tag that must match `expected`.
fn application_content(data: &[u8], expected: ApplicationTag) -> Result<(&[u8], usize)> {
    let (tag, length, header) = decode_application_tag(data)?;
    if tag != expected {
        return Err(EncodingError::InvalidTag);
    }
    let content = data
        .get(header..header + length)
        .ok_or(EncodingError::BufferUnderflow)?;
    Ok((content, header + length))
}

fn context_content(data: &[u8], tag_number: u8) -> Result<(&[u8], usize)> {
    let (tag, header) = decode_tag(data)?;
    match tag {
        Tag {
            number,
            context: true,
            kind: TagKind::Value(length),
        } if number == tag_number => {
            let content = data
                .get(header..header + length)
                .ok_or(EncodingError::BufferUnderflow)?;
            Ok((content, header + length))
        }
        _ => Err(EncodingError::UnexpectedTag { expected: tag_number }),
    }
}

/// Encode a BACnet null
pub fn encode_null(buffer: &mut Vec<u8>) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Null, 0)
}

/// Encode a BACnet boolean value
pub fn encode_boolean(buffer: &mut Vec<u8>, value: bool) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Boolean, value as usize)
}

/// Decode a BACnet boolean value
pub fn decode_boolean(data: &[u8]) -> Result<(bool, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != ApplicationTag::Boolean {
        return Err(EncodingError::InvalidTag);
    }
    match length {
        0 => Ok((false, consumed)),
        1 => Ok((true, consumed)),
        _ => Err(EncodingError::InvalidLength),
    }
}

/// Encode a BACnet unsigned integer
pub fn encode_unsigned(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    let (bytes, len) = unsigned_octets(value);
    encode_application_tag(buffer, ApplicationTag::UnsignedInt, len)?;
    buffer.extend_from_slice(&bytes[4 - len..]);
    Ok(())
}

/// Decode a BACnet unsigned integer
pub fn decode_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::UnsignedInt)?;
    Ok((decode_unsigned_octets(content)?, consumed))
}

/// Encode a BACnet signed integer
pub fn encode_signed(buffer: &mut Vec<u8>, value: i32) -> Result<()> {
    let len = match value {
        -0x80..=0x7F => 1,
        -0x8000..=0x7FFF => 2,
        -0x80_0000..=0x7F_FFFF => 3,
        _ => 4,
    };
    encode_application_tag(buffer, ApplicationTag::SignedInt, len)?;
    buffer.extend_from_slice(&value.to_be_bytes()[4 - len..]);
    Ok(())
}

/// Decode a BACnet signed integer
pub fn decode_signed(data: &[u8]) -> Result<(i32, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::SignedInt)?;
    if content.is_empty() || content.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    let sign = if content[0] & 0x80 != 0 { -1i32 } else { 0 };
    let value = content.iter().fold(sign, |acc, b| (acc << 8) | *b as i32);
    Ok((value, consumed))
}

/// Encode a BACnet enumerated value
pub fn encode_enumerated(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    let (bytes, len) = unsigned_octets(value);
    encode_application_tag(buffer, ApplicationTag::Enumerated, len)?;
    buffer.extend_from_slice(&bytes[4 - len..]);
    Ok(())
}

/// Decode a BACnet enumerated value
pub fn decode_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::Enumerated)?;
    Ok((decode_unsigned_octets(content)?, consumed))
}

/// Encode a BACnet real (float) value
pub fn encode_real(buffer: &mut Vec<u8>, value: f32) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Real, 4)?;
    buffer.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Decode a BACnet real (float) value
pub fn decode_real(data: &[u8]) -> Result<(f32, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::Real)?;
    let bytes: [u8; 4] = content.try_into().map_err(|_| EncodingError::InvalidLength)?;
    Ok((f32::from_be_bytes(bytes), consumed))
}

/// Encode a BACnet octet string
pub fn encode_octet_string(buffer: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::OctetString, value.len())?;
    buffer.extend_from_slice(value);
    Ok(())
}

/// Decode a BACnet octet string
pub fn decode_octet_string(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::OctetString)?;
    Ok((content.to_vec(), consumed))
}

fn character_string_from(content: &[u8]) -> Result<String> {
    let (charset, text) = content.split_first().ok_or(EncodingError::InvalidLength)?;
    if *charset != 0 {
        return Err(EncodingError::InvalidFormat(format!(
            "unsupported character set {}",
            charset
        )));
    }
    String::from_utf8(text.to_vec())
        .map_err(|_| EncodingError::InvalidFormat("invalid UTF-8 string".to_string()))
}

/// Encode a BACnet character string (ANSI X3.4 / UTF-8)
pub fn encode_character_string(buffer: &mut Vec<u8>, value: &str) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::CharacterString, value.len() + 1)?;
    buffer.push(0);
    buffer.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Decode a BACnet character string
pub fn decode_character_string(data: &[u8]) -> Result<(String, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::CharacterString)?;
    Ok((character_string_from(content)?, consumed))
}

/// Encode a BACnet bit string
pub fn encode_bit_string(buffer: &mut Vec<u8>, bits: &[bool]) -> Result<()> {
    let byte_count = bits.len().div_ceil(8);
    let unused_bits = byte_count * 8 - bits.len();

    encode_application_tag(buffer, ApplicationTag::BitString, byte_count + 1)?;
    buffer.push(unused_bits as u8);
    for chunk in bits.chunks(8) {
        let byte = chunk
            .iter()
            .enumerate()
            .filter(|(_, bit)| **bit)
            .fold(0u8, |acc, (i, _)| acc | (0x80 >> i));
        buffer.push(byte);
    }
    Ok(())
}

/// Encode a bit string under context tag `tag_number`
pub fn encode_context_bit_string(buffer: &mut Vec<u8>, tag_number: u8, bits: &[bool]) -> Result<()> {
    let mut encoded = Vec::with_capacity(bits.len() / 8 + 2);
    encode_bit_string(&mut encoded, bits)?;
    let (_, _, header) = decode_application_tag(&encoded)?;
    encode_tag(buffer, tag_number, true, encoded.len() - header)?;
    buffer.extend_from_slice(&encoded[header..]);
    Ok(())
}

/// Decode a BACnet bit string
pub fn decode_bit_string(data: &[u8]) -> Result<(Vec<bool>, usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::BitString)?;
    let (unused, octets) = content.split_first().ok_or(EncodingError::InvalidLength)?;
    if *unused > 7 || (octets.is_empty() && *unused != 0) {
        return Err(EncodingError::InvalidFormat("invalid unused bits count".to_string()));
    }
    let total = octets.len() * 8 - *unused as usize;
    let bits = (0..total)
        .map(|i| octets[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect();
    Ok((bits, consumed))
}

/// Encode a BACnet date
pub fn encode_date(buffer: &mut Vec<u8>, year: u16, month: u8, day: u8, weekday: u8) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Date, 4)?;
    let year = if year == 255 { 255 } else { year.checked_sub(1900).ok_or(EncodingError::ValueOutOfRange)? };
    if year > 255 {
        return Err(EncodingError::ValueOutOfRange);
    }
    buffer.extend_from_slice(&[year as u8, month, day, weekday]);
    Ok(())
}

/// Decode a BACnet date as `(year, month, day, weekday)`; 255 means unspecified
pub fn decode_date(data: &[u8]) -> Result<((u16, u8, u8, u8), usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::Date)?;
    let [year, month, day, weekday]: [u8; 4] =
        content.try_into().map_err(|_| EncodingError::InvalidLength)?;
    let year = if year == 255 { 255 } else { 1900 + year as u16 };
    Ok(((year, month, day, weekday), consumed))
}

/// Encode a BACnet time
pub fn encode_time(buffer: &mut Vec<u8>, hour: u8, minute: u8, second: u8, hundredths: u8) -> Result<()> {
    encode_application_tag(buffer, ApplicationTag::Time, 4)?;
    buffer.extend_from_slice(&[hour, minute, second, hundredths]);
    Ok(())
}

/// Decode a BACnet time as `(hour, minute, second, hundredths)`
pub fn decode_time(data: &[u8]) -> Result<((u8, u8, u8, u8), usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::Time)?;
    let [hour, minute, second, hundredths]: [u8; 4] =
        content.try_into().map_err(|_| EncodingError::InvalidLength)?;
    Ok(((hour, minute, second, hundredths), consumed))
}

fn object_id_octets(object_type: u16, instance: u32) -> Result<[u8; 4]> {
    crate::util::encode_object_id(object_type, instance)
        .map(u32::to_be_bytes)
        .ok_or(EncodingError::ValueOutOfRange)
}

fn object_id_from(content: &[u8]) -> Result<(u16, u32)> {
    let bytes: [u8; 4] = content.try_into().map_err(|_| EncodingError::InvalidLength)?;
    Ok(crate::util::decode_object_id(u32::from_be_bytes(bytes)))
}

/// Encode a BACnet object identifier
pub fn encode_object_identifier(buffer: &mut Vec<u8>, object_type: u16, instance: u32) -> Result<()> {
    let octets = object_id_octets(object_type, instance)?;
    encode_application_tag(buffer, ApplicationTag::ObjectIdentifier, 4)?;
    buffer.extend_from_slice(&octets);
    Ok(())
}

/// Decode a BACnet object identifier
pub fn decode_object_identifier(data: &[u8]) -> Result<((u16, u32), usize)> {
    let (content, consumed) = application_content(data, ApplicationTag::ObjectIdentifier)?;
    Ok((object_id_from(content)?, consumed))
}

/// Encode an unsigned integer under context tag `tag_number`
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    let (bytes, len) = unsigned_octets(value);
    encode_tag(buffer, tag_number, true, len)?;
    buffer.extend_from_slice(&bytes[4 - len..]);
    Ok(())
}

pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (content, consumed) = context_content(data, tag_number)?;
    Ok((decode_unsigned_octets(content)?, consumed))
}

/// Encode an enumerated value under context tag `tag_number`
pub fn encode_context_enumerated(buffer: &mut Vec<u8>, tag_number: u8, value: u32) -> Result<()> {
    encode_context_unsigned(buffer, tag_number, value)
}

pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, tag_number)
}

pub fn encode_context_boolean(buffer: &mut Vec<u8>, tag_number: u8, value: bool) -> Result<()> {
    encode_tag(buffer, tag_number, true, 1)?;
    buffer.push(value as u8);
    Ok(())
}

pub fn decode_context_boolean(data: &[u8], tag_number: u8) -> Result<(bool, usize)> {
    let (content, consumed) = context_content(data, tag_number)?;
    match content {
        [value] => Ok((*value != 0, consumed)),
        _ => Err(EncodingError::InvalidLength),
    }
}

pub fn encode_context_object_id(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    object_type: u16,
    instance: u32,
) -> Result<()> {
    let octets = object_id_octets(object_type, instance)?;
    encode_tag(buffer, tag_number, true, 4)?;
    buffer.extend_from_slice(&octets);
    Ok(())
}

pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<((u16, u32), usize)> {
    let (content, consumed) = context_content(data, tag_number)?;
    Ok((object_id_from(content)?, consumed))
}

pub fn encode_context_character_string(buffer: &mut Vec<u8>, tag_number: u8, value: &str) -> Result<()> {
    encode_tag(buffer, tag_number, true, value.len() + 1)?;
    buffer.push(0);
    buffer.extend_from_slice(value.as_bytes());
    Ok(())
}

pub fn decode_context_character_string(data: &[u8], tag_number: u8) -> Result<(String, usize)> {
    let (content, consumed) = context_content(data, tag_number)?;
    Ok((character_string_from(content)?, consumed))
}

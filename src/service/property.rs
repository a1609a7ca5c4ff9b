//! Property access services.
//!
//! ReadProperty, WriteProperty, ReadPropertyMultiple, WritePropertyMultiple and
//! ReadRange. Each server handler decodes the request, resolves the wildcard
//! device instance, calls the [`ObjectDatabase`](crate::object::ObjectDatabase)
//! and builds the acknowledgement. A reply that outgrows the requester's
//! maximum APDU size is aborted with segmentation-not-supported.
//!
//! The client half covers ReadProperty: [`encode_read_property_apdu`] builds a
//! complete confirmed request and [`ReadPropertyAck::decode`] parses the
//! service data of the matching Complex-Ack.

use log::{debug, warn};

use crate::app::{self, ApduType, ApplicationLayer, ConfirmedRequest};
use crate::buffer::BacnetBuf;
use crate::encoding::{
    decode_context_enumerated, decode_context_object_id, decode_context_unsigned, decode_date,
    decode_signed, decode_tag, decode_time, decode_unsigned, encode_closing_tag,
    encode_context_enumerated, encode_context_object_id, encode_context_unsigned, encode_date,
    encode_enumerated, encode_opening_tag, encode_signed, encode_time, encode_unsigned,
    extract_constructed, has_context_tag, is_closing_tag,
    Result as EncodingResult, TagKind,
};
use crate::network::BacnetAddress;
use crate::object::{PropertyIdentifier, PropertyReference};
use crate::service::{
    expect_end, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason, ServiceError,
    ServiceFailure,
};

/// Array index value meaning "the whole array" on the wire.
pub const BACNET_ARRAY_ALL: u32 = 0xFFFF_FFFF;

/// Lowest and highest command priority.
pub const BACNET_MIN_PRIORITY: u8 = 1;
pub const BACNET_MAX_PRIORITY: u8 = 16;

fn decode_reference(data: &[u8], tags: [u8; 3]) -> EncodingResult<(PropertyReference, usize)> {
    let (object, mut pos) = decode_context_object_id(data, tags[0])?;
    let (property, consumed) = decode_context_enumerated(&data[pos..], tags[1])?;
    pos += consumed;

    let mut reference = PropertyReference::new(object.into(), property.into());
    if has_context_tag(&data[pos..], tags[2]) {
        let (index, consumed) = decode_context_unsigned(&data[pos..], tags[2])?;
        pos += consumed;
        if index != BACNET_ARRAY_ALL {
            reference.array_index = Some(index);
        }
    }
    Ok((reference, pos))
}

fn encode_reference(buffer: &mut Vec<u8>, reference: &PropertyReference, tags: [u8; 3]) -> EncodingResult<()> {
    let (object_type, instance) = reference.object.raw_parts();
    encode_context_object_id(buffer, tags[0], object_type, instance)?;
    encode_property_and_index(buffer, reference.property, reference.array_index, [tags[1], tags[2]])
}

fn encode_property_and_index(
    buffer: &mut Vec<u8>,
    property: PropertyIdentifier,
    array_index: Option<u32>,
    tags: [u8; 2],
) -> EncodingResult<()> {
    encode_context_enumerated(buffer, tags[0], property.into())?;
    if let Some(index) = array_index {
        encode_context_unsigned(buffer, tags[1], index)?;
    }
    Ok(())
}

fn resolve(app: &ApplicationLayer, reference: PropertyReference) -> PropertyReference {
    PropertyReference {
        object: reference.object.resolve_wildcard(app.device_instance()),
        ..reference
    }
}

fn complex_ack(
    reply: &mut BacnetBuf,
    invoke_id: u8,
    choice: ConfirmedServiceChoice,
    body: &[u8],
) -> Result<(), ServiceFailure> {
    app::encode_complex_ack_header(reply, invoke_id, choice as u8)?;
    reply.put_slice(body)?;
    Ok(())
}

/// ReadProperty-Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub reference: PropertyReference,
}

impl ReadPropertyRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_reference(buffer, &self.reference, [0, 1, 2])
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceFailure> {
        let (reference, consumed) = decode_reference(data, [0, 1, 2])?;
        expect_end(data, consumed)?;
        Ok(Self { reference })
    }
}

/// Builds a complete ReadProperty confirmed request in `buf`.
pub fn encode_read_property_apdu(
    buf: &mut BacnetBuf,
    invoke_id: u8,
    reference: &PropertyReference,
) -> Result<(), ServiceError> {
    let mut body = Vec::new();
    ReadPropertyRequest { reference: *reference }.encode(&mut body)?;
    app::encode_confirmed_service_request(buf, invoke_id, ConfirmedServiceChoice::ReadProperty as u8)?;
    buf.put_slice(&body)?;
    Ok(())
}

/// ReadProperty-ACK service data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub reference: PropertyReference,
    /// Application-encoded property value
    pub value: Vec<u8>,
}

impl ReadPropertyAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_reference(buffer, &self.reference, [0, 1, 2])?;
        encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.value);
        encode_closing_tag(buffer, 3)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceError> {
        let (reference, pos) = decode_reference(data, [0, 1, 2])?;
        let (value, consumed) = extract_constructed(&data[pos..], 3)?;
        if pos + consumed != data.len() {
            return Err(ServiceError::InvalidParameters(
                "unexpected data after property value".to_string(),
            ));
        }
        Ok(Self {
            reference,
            value: value.to_vec(),
        })
    }
}

pub fn handle_read_property(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let reference = resolve(app, ReadPropertyRequest::decode(request.service_data)?.reference);
    debug!(
        "ReadProperty {} {} from {}",
        reference.object, reference.property, src
    );

    let mut body = Vec::with_capacity(reply.capacity());
    encode_reference(&mut body, &reference, [0, 1, 2])?;
    encode_opening_tag(&mut body, 3)?;
    app.database().read_property(&reference, &mut body)?;
    encode_closing_tag(&mut body, 3)?;

    complex_ack(reply, request.invoke_id, ConfirmedServiceChoice::ReadProperty, &body)
}

/// WriteProperty-Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePropertyRequest {
    pub reference: PropertyReference,
    /// Application-encoded value
    pub value: Vec<u8>,
    pub priority: Option<u8>,
}

fn decode_priority(data: &[u8], tag: u8) -> Result<(Option<u8>, usize), ServiceFailure> {
    if !has_context_tag(data, tag) {
        return Ok((None, 0));
    }
    let (priority, consumed) = decode_context_unsigned(data, tag)?;
    match u8::try_from(priority) {
        Ok(p) if (BACNET_MIN_PRIORITY..=BACNET_MAX_PRIORITY).contains(&p) => Ok((Some(p), consumed)),
        _ => Err(ServiceFailure::Reject(RejectReason::InvalidParameterDataType)),
    }
}

impl WritePropertyRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_reference(buffer, &self.reference, [0, 1, 2])?;
        encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.value);
        encode_closing_tag(buffer, 3)?;
        if let Some(priority) = self.priority {
            encode_context_unsigned(buffer, 4, priority as u32)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceFailure> {
        let (reference, mut pos) = decode_reference(data, [0, 1, 2])?;
        if pos >= data.len() {
            return Err(ServiceFailure::Reject(RejectReason::MissingRequiredParameter));
        }
        let (value, consumed) = extract_constructed(&data[pos..], 3)?;
        pos += consumed;

        let (priority, consumed) = decode_priority(&data[pos..], 4)?;
        pos += consumed;
        expect_end(data, pos)?;

        Ok(Self {
            reference,
            value: value.to_vec(),
            priority,
        })
    }
}

pub fn handle_write_property(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let write = WritePropertyRequest::decode(request.service_data)?;
    let reference = resolve(app, write.reference);
    debug!(
        "WriteProperty {} {} from {}",
        reference.object, reference.property, src
    );

    app.database()
        .write_property(&reference, &write.value, write.priority)?;
    app::encode_simple_ack(reply, request.invoke_id, ConfirmedServiceChoice::WriteProperty as u8)?;
    Ok(())
}

/// One property result inside a ReadPropertyMultiple-ACK.
fn encode_read_result(
    body: &mut Vec<u8>,
    property: PropertyIdentifier,
    array_index: Option<u32>,
    result: Result<Vec<u8>, (ErrorClass, ErrorCode)>,
) -> EncodingResult<()> {
    encode_property_and_index(body, property, array_index, [2, 3])?;
    match result {
        Ok(value) => {
            encode_opening_tag(body, 4)?;
            body.extend_from_slice(&value);
            encode_closing_tag(body, 4)
        }
        Err((class, code)) => {
            encode_opening_tag(body, 5)?;
            encode_enumerated(body, u16::from(class) as u32)?;
            encode_enumerated(body, u16::from(code) as u32)?;
            encode_closing_tag(body, 5)
        }
    }
}

/// Reads one property for ReadPropertyMultiple. Error-class failures are
/// embedded in the result; reject and abort fail the whole request.
fn read_for_multiple(
    app: &ApplicationLayer,
    reference: &PropertyReference,
) -> Result<Result<Vec<u8>, (ErrorClass, ErrorCode)>, ServiceFailure> {
    let mut value = Vec::new();
    match app.database().read_property(reference, &mut value) {
        Ok(()) => Ok(Ok(value)),
        Err(ServiceFailure::Error { class, code }) => Ok(Err((class, code))),
        Err(other) => Err(other),
    }
}

pub fn handle_read_property_multiple(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    _src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let data = request.service_data;
    let mut body = Vec::with_capacity(reply.capacity());
    let mut pos = 0;

    loop {
        let (object, consumed) = decode_context_object_id(&data[pos..], 0)?;
        pos += consumed;
        let object = crate::object::ObjectIdentifier::from(object).resolve_wildcard(app.device_instance());

        match decode_tag(&data[pos..])? {
            (tag, len) if tag.is_opening(1) => pos += len,
            _ => return Err(ServiceFailure::Reject(RejectReason::InvalidTag)),
        }

        let (object_type, instance) = object.raw_parts();
        encode_context_object_id(&mut body, 0, object_type, instance)?;
        encode_opening_tag(&mut body, 1)?;

        loop {
            let (property, consumed) = decode_context_enumerated(&data[pos..], 0)?;
            pos += consumed;
            let property = PropertyIdentifier::from(property);

            let mut array_index = None;
            if has_context_tag(&data[pos..], 1) {
                let (index, consumed) = decode_context_unsigned(&data[pos..], 1)?;
                pos += consumed;
                if index != BACNET_ARRAY_ALL {
                    array_index = Some(index);
                }
            }

            match property {
                PropertyIdentifier::All | PropertyIdentifier::Required | PropertyIdentifier::Optional => {
                    if array_index.is_some() {
                        encode_read_result(
                            &mut body,
                            property,
                            array_index,
                            Err((ErrorClass::Property, ErrorCode::PropertyIsNotAnArray)),
                        )?;
                    } else if let Some(lists) = app.database().property_lists(object) {
                        let selected: Vec<PropertyIdentifier> = match property {
                            PropertyIdentifier::All => lists.all().collect(),
                            PropertyIdentifier::Required => lists.required.clone(),
                            _ => lists.optional.clone(),
                        };
                        if selected.is_empty() {
                            encode_read_result(
                                &mut body,
                                property,
                                None,
                                Err((ErrorClass::Property, ErrorCode::UnknownProperty)),
                            )?;
                        }
                        for selected_property in selected {
                            let reference = PropertyReference::new(object, selected_property);
                            let result = read_for_multiple(app, &reference)?;
                            encode_read_result(&mut body, selected_property, None, result)?;
                        }
                    } else {
                        encode_read_result(
                            &mut body,
                            property,
                            None,
                            Err((ErrorClass::Object, ErrorCode::UnknownObject)),
                        )?;
                    }
                }
                _ => {
                    let reference = PropertyReference {
                        object,
                        property,
                        array_index,
                    };
                    let result = read_for_multiple(app, &reference)?;
                    encode_read_result(&mut body, property, array_index, result)?;
                }
            }

            if body.len() + 3 > reply.capacity() {
                warn!("ReadPropertyMultiple reply exceeds {} bytes", reply.capacity());
                return Err(ServiceFailure::Abort(crate::service::AbortReason::SegmentationNotSupported));
            }

            if is_closing_tag(&data[pos..], 1) {
                pos += 1;
                encode_closing_tag(&mut body, 1)?;
                break;
            }
        }

        if pos >= data.len() {
            break;
        }
    }

    complex_ack(reply, request.invoke_id, ConfirmedServiceChoice::ReadPropertyMultiple, &body)
}

/// One write decoded from a WritePropertyMultiple request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAccess {
    pub reference: PropertyReference,
    pub value: Vec<u8>,
    pub priority: Option<u8>,
}

/// Decodes every write access of a WritePropertyMultiple request up front, so
/// a malformed request is rejected before anything is written.
pub fn decode_write_property_multiple(data: &[u8]) -> Result<Vec<WriteAccess>, ServiceFailure> {
    let mut writes = Vec::new();
    let mut pos = 0;

    loop {
        let (object, consumed) = decode_context_object_id(&data[pos..], 0)?;
        pos += consumed;
        match decode_tag(&data[pos..])? {
            (tag, len) if tag.is_opening(1) => pos += len,
            _ => return Err(ServiceFailure::Reject(RejectReason::InvalidTag)),
        }

        loop {
            let (property, consumed) = decode_context_enumerated(&data[pos..], 0)?;
            pos += consumed;
            let mut reference = PropertyReference::new(object.into(), property.into());

            if has_context_tag(&data[pos..], 1) {
                let (index, consumed) = decode_context_unsigned(&data[pos..], 1)?;
                pos += consumed;
                if index == BACNET_ARRAY_ALL {
                    return Err(ServiceFailure::Reject(RejectReason::ParameterOutOfRange));
                }
                reference.array_index = Some(index);
            }

            let (value, consumed) = extract_constructed(&data[pos..], 2)?;
            pos += consumed;

            let (priority, consumed) = decode_priority(&data[pos..], 3)?;
            pos += consumed;

            writes.push(WriteAccess {
                reference,
                value: value.to_vec(),
                priority,
            });

            if is_closing_tag(&data[pos..], 1) {
                pos += 1;
                break;
            }
            if pos >= data.len() {
                return Err(ServiceFailure::Reject(RejectReason::MissingRequiredParameter));
            }
        }

        if pos >= data.len() {
            return Ok(writes);
        }
    }
}

fn encode_write_multiple_error(
    reply: &mut BacnetBuf,
    invoke_id: u8,
    class: ErrorClass,
    code: ErrorCode,
    reference: &PropertyReference,
) -> Result<(), ServiceFailure> {
    let mut body = Vec::new();
    encode_opening_tag(&mut body, 0)?;
    encode_enumerated(&mut body, u16::from(class) as u32)?;
    encode_enumerated(&mut body, u16::from(code) as u32)?;
    encode_closing_tag(&mut body, 0)?;
    encode_opening_tag(&mut body, 1)?;
    encode_reference(&mut body, reference, [0, 1, 2])?;
    encode_closing_tag(&mut body, 1)?;

    reply.clear();
    reply.put_slice(&[
        (ApduType::Error as u8) << 4,
        invoke_id,
        ConfirmedServiceChoice::WritePropertyMultiple as u8,
    ])?;
    reply.put_slice(&body)?;
    Ok(())
}

pub fn handle_write_property_multiple(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    _src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let writes = decode_write_property_multiple(request.service_data)?;

    for write in &writes {
        let reference = resolve(app, write.reference);
        match app
            .database()
            .write_property(&reference, &write.value, write.priority)
        {
            Ok(()) => {}
            Err(ServiceFailure::Error { class, code }) => {
                warn!(
                    "WritePropertyMultiple failed at {} {}: {}/{}",
                    reference.object, reference.property, class, code
                );
                return encode_write_multiple_error(reply, request.invoke_id, class, code, &reference);
            }
            Err(other) => return Err(other),
        }
    }

    app::encode_simple_ack(
        reply,
        request.invoke_id,
        ConfirmedServiceChoice::WritePropertyMultiple as u8,
    )?;
    Ok(())
}

/// Range selector of a ReadRange request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No range given: every item
    All,
    ByPosition { reference_index: u32, count: i32 },
    BySequenceNumber { reference_sequence: u32, count: i32 },
    ByTime {
        date: (u16, u8, u8, u8),
        time: (u8, u8, u8, u8),
        count: i32,
    },
}

/// ReadRange-Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRangeRequest {
    pub reference: PropertyReference,
    pub range: RangeSpec,
}

impl ReadRangeRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_reference(buffer, &self.reference, [0, 1, 2])?;
        match self.range {
            RangeSpec::All => {}
            RangeSpec::ByPosition {
                reference_index,
                count,
            } => {
                encode_opening_tag(buffer, 3)?;
                encode_unsigned(buffer, reference_index)?;
                encode_signed(buffer, count)?;
                encode_closing_tag(buffer, 3)?;
            }
            RangeSpec::BySequenceNumber {
                reference_sequence,
                count,
            } => {
                encode_opening_tag(buffer, 6)?;
                encode_unsigned(buffer, reference_sequence)?;
                encode_signed(buffer, count)?;
                encode_closing_tag(buffer, 6)?;
            }
            RangeSpec::ByTime { date, time, count } => {
                encode_opening_tag(buffer, 7)?;
                encode_date(buffer, date.0, date.1, date.2, date.3)?;
                encode_time(buffer, time.0, time.1, time.2, time.3)?;
                encode_signed(buffer, count)?;
                encode_closing_tag(buffer, 7)?;
            }
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceFailure> {
        let (reference, mut pos) = decode_reference(data, [0, 1, 2])?;
        if pos >= data.len() {
            return Ok(Self {
                reference,
                range: RangeSpec::All,
            });
        }

        let (tag, _) = decode_tag(&data[pos..])?;
        if !tag.context || tag.kind != TagKind::Opening {
            return Err(ServiceFailure::Reject(RejectReason::InvalidTag));
        }
        let (inner, consumed) = extract_constructed(&data[pos..], tag.number)?;
        pos += consumed;

        let range = match tag.number {
            3 | 6 => {
                let (reference_value, used) = decode_unsigned(inner)?;
                let (count, rest) = decode_signed(&inner[used..])?;
                expect_end(inner, used + rest)?;
                if tag.number == 3 {
                    RangeSpec::ByPosition {
                        reference_index: reference_value,
                        count,
                    }
                } else {
                    RangeSpec::BySequenceNumber {
                        reference_sequence: reference_value,
                        count,
                    }
                }
            }
            7 => {
                let (date, mut used) = decode_date(inner)?;
                let (time, consumed) = decode_time(&inner[used..])?;
                used += consumed;
                let (count, consumed) = decode_signed(&inner[used..])?;
                expect_end(inner, used + consumed)?;
                RangeSpec::ByTime { date, time, count }
            }
            _ => return Err(ServiceFailure::Reject(RejectReason::InvalidTag)),
        };

        expect_end(data, pos)?;
        Ok(Self { reference, range })
    }
}

pub fn handle_read_range(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let read = ReadRangeRequest::decode(request.service_data)?;
    let reference = resolve(app, read.reference);
    debug!(
        "ReadRange {} {} {:?} from {}",
        reference.object, reference.property, read.range, src
    );

    let mut body = Vec::with_capacity(reply.capacity());
    encode_reference(&mut body, &reference, [0, 1, 2])?;
    app.database().read_range(&reference, &read.range, &mut body)?;

    complex_ack(reply, request.invoke_id, ConfirmedServiceChoice::ReadRange, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectIdentifier, ObjectType};

    fn analog_input(instance: u32, property: PropertyIdentifier) -> PropertyReference {
        PropertyReference::new(ObjectIdentifier::new(ObjectType::AnalogInput, instance), property)
    }

    #[test]
    fn test_read_property_request_encoding() {
        let request = ReadPropertyRequest {
            reference: analog_input(1, PropertyIdentifier::PresentValue),
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0x0C, 0x00, 0x00, 0x00, 0x01, 0x19, 0x55]);
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn test_read_property_request_rejects() {
        assert_eq!(
            ReadPropertyRequest::decode(&[]),
            Err(ServiceFailure::Reject(RejectReason::MissingRequiredParameter))
        );
        assert_eq!(
            ReadPropertyRequest::decode(&[0x19, 0x55]),
            Err(ServiceFailure::Reject(RejectReason::InvalidTag))
        );
        let mut buffer = Vec::new();
        ReadPropertyRequest {
            reference: analog_input(1, PropertyIdentifier::PresentValue),
        }
        .encode(&mut buffer)
        .unwrap();
        buffer.push(0x00);
        assert_eq!(
            ReadPropertyRequest::decode(&buffer),
            Err(ServiceFailure::Reject(RejectReason::TooManyArguments))
        );
    }

    #[test]
    fn test_read_property_apdu() {
        let mut buf = BacnetBuf::new(50);
        encode_read_property_apdu(&mut buf, 7, &analog_input(1, PropertyIdentifier::PresentValue)).unwrap();
        assert_eq!(&buf.data()[..4], &[0x00, 0x05, 7, 12]);
        assert_eq!(buf.len(), 4 + 7);
    }

    #[test]
    fn test_read_property_ack_decoding() {
        let ack = ReadPropertyAck {
            reference: analog_input(1, PropertyIdentifier::PresentValue).with_index(2),
            value: vec![0x44, 0x41, 0xB8, 0x00, 0x00],
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyAck::decode(&buffer).unwrap(), ack);
        assert!(ReadPropertyAck::decode(&buffer[..buffer.len() - 1]).is_err());
    }

    #[test]
    fn test_write_property_priority() {
        let mut request = WritePropertyRequest {
            reference: analog_input(2, PropertyIdentifier::PresentValue),
            value: vec![0x44, 0x42, 0x48, 0x00, 0x00],
            priority: Some(8),
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(WritePropertyRequest::decode(&buffer).unwrap(), request);

        request.priority = Some(17);
        buffer.clear();
        request.encode(&mut buffer).unwrap();
        assert_eq!(
            WritePropertyRequest::decode(&buffer),
            Err(ServiceFailure::Reject(RejectReason::InvalidParameterDataType))
        );
    }

    #[test]
    fn test_write_property_missing_value() {
        let mut buffer = Vec::new();
        encode_reference(&mut buffer, &analog_input(2, PropertyIdentifier::PresentValue), [0, 1, 2]).unwrap();
        assert_eq!(
            WritePropertyRequest::decode(&buffer),
            Err(ServiceFailure::Reject(RejectReason::MissingRequiredParameter))
        );
    }

    #[test]
    fn test_write_property_multiple_decoding() {
        let mut buffer = Vec::new();
        encode_context_object_id(&mut buffer, 0, 2, 1).unwrap();
        encode_opening_tag(&mut buffer, 1).unwrap();
        encode_context_enumerated(&mut buffer, 0, 85).unwrap();
        encode_opening_tag(&mut buffer, 2).unwrap();
        encode_unsigned(&mut buffer, 5).unwrap();
        encode_closing_tag(&mut buffer, 2).unwrap();
        encode_context_unsigned(&mut buffer, 3, 10).unwrap();
        encode_context_enumerated(&mut buffer, 0, 28).unwrap();
        encode_context_unsigned(&mut buffer, 1, 2).unwrap();
        encode_opening_tag(&mut buffer, 2).unwrap();
        encode_unsigned(&mut buffer, 6).unwrap();
        encode_closing_tag(&mut buffer, 2).unwrap();
        encode_closing_tag(&mut buffer, 1).unwrap();

        let writes = decode_write_property_multiple(&buffer).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].priority, Some(10));
        assert_eq!(writes[0].value, vec![0x21, 5]);
        assert_eq!(writes[1].reference.array_index, Some(2));
        assert_eq!(writes[1].reference.property, PropertyIdentifier::Description);

        // unterminated property list
        assert_eq!(
            decode_write_property_multiple(&buffer[..buffer.len() - 1]),
            Err(ServiceFailure::Reject(RejectReason::MissingRequiredParameter))
        );
    }

    #[test]
    fn test_read_range_request() {
        let request = ReadRangeRequest {
            reference: PropertyReference::new(
                ObjectIdentifier::new(ObjectType::TrendLog, 1),
                PropertyIdentifier::LogBuffer,
            ),
            range: RangeSpec::ByPosition {
                reference_index: 3,
                count: -2,
            },
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(ReadRangeRequest::decode(&buffer).unwrap(), request);

        let all = ReadRangeRequest {
            range: RangeSpec::All,
            ..request
        };
        buffer.clear();
        all.encode(&mut buffer).unwrap();
        assert_eq!(ReadRangeRequest::decode(&buffer).unwrap(), all);
    }

    #[test]
    fn test_read_range_by_time() {
        let request = ReadRangeRequest {
            reference: PropertyReference::new(
                ObjectIdentifier::new(ObjectType::TrendLog, 1),
                PropertyIdentifier::LogBuffer,
            ),
            range: RangeSpec::ByTime {
                date: (2024, 1, 2, 2),
                time: (3, 4, 5, 0),
                count: 10,
            },
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(ReadRangeRequest::decode(&buffer).unwrap(), request);
    }
}

//! Device and object discovery: Who-Is / I-Am and Who-Has / I-Have.
//!
//! Who-Is and Who-Has carry an optional device instance range; an empty range
//! addresses every device. A device answers Who-Is with an I-Am broadcast on
//! the requester's network, and Who-Has with an I-Have global broadcast when
//! it owns the named object. I-Am is also how the address binding cache
//! learns where a device lives.

use log::{debug, trace, warn};

use crate::app::ApplicationLayer;
use crate::encoding::{
    decode_character_string, decode_context_character_string, decode_context_object_id,
    decode_context_unsigned, decode_enumerated, decode_object_identifier, decode_unsigned,
    encode_character_string, encode_context_character_string, encode_context_object_id,
    encode_context_unsigned, encode_enumerated, encode_object_identifier, encode_unsigned,
    has_context_tag, EncodingError, Result as EncodingResult,
};
use crate::network::BacnetAddress;
use crate::object::{ObjectIdentifier, ObjectType, Segmentation};
use crate::BACNET_MAX_INSTANCE;

fn decode_range(data: &[u8]) -> EncodingResult<(Option<(u32, u32)>, usize)> {
    if !has_context_tag(data, 0) {
        return Ok((None, 0));
    }
    let (low, mut pos) = decode_context_unsigned(data, 0)?;
    let (high, consumed) = decode_context_unsigned(&data[pos..], 1)?;
    pos += consumed;
    if high > BACNET_MAX_INSTANCE || low > high {
        return Err(EncodingError::ValueOutOfRange);
    }
    Ok((Some((low, high)), pos))
}

fn encode_range(buffer: &mut Vec<u8>, range: Option<(u32, u32)>) -> EncodingResult<()> {
    if let Some((low, high)) = range {
        if high > BACNET_MAX_INSTANCE || low > high {
            return Err(EncodingError::ValueOutOfRange);
        }
        encode_context_unsigned(buffer, 0, low)?;
        encode_context_unsigned(buffer, 1, high)?;
    }
    Ok(())
}

/// Who-Is request (unconfirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    /// Inclusive device instance range; `None` addresses every device
    pub range: Option<(u32, u32)>,
}

impl WhoIsRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_device(device_instance: u32) -> Self {
        Self::for_range(device_instance, device_instance)
    }

    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            range: Some((low, high)),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_range(buffer, self.range)
    }

    /// Limits must come as a pair, lie within the instance space and be
    /// ordered. Trailing bytes are an error.
    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let (range, consumed) = decode_range(data)?;
        if consumed != data.len() {
            return Err(EncodingError::InvalidFormat(
                "unexpected data after Who-Is limits".to_string(),
            ));
        }
        Ok(Self { range })
    }

    pub fn matches(&self, device_instance: u32) -> bool {
        match self.range {
            None => device_instance <= BACNET_MAX_INSTANCE,
            Some((low, high)) => (low..=high).contains(&device_instance),
        }
    }
}

/// I-Am announcement (unconfirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    pub device_identifier: ObjectIdentifier,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: Segmentation,
    pub vendor_identifier: u16,
}

impl IAmRequest {
    pub fn new(device_instance: u32, max_apdu_length_accepted: u32, vendor_identifier: u16) -> Self {
        Self {
            device_identifier: ObjectIdentifier::new(ObjectType::Device, device_instance),
            max_apdu_length_accepted,
            segmentation_supported: Segmentation::NoSegmentation,
            vendor_identifier,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        let (object_type, instance) = self.device_identifier.raw_parts();
        encode_object_identifier(buffer, object_type, instance)?;
        encode_unsigned(buffer, self.max_apdu_length_accepted)?;
        encode_enumerated(buffer, self.segmentation_supported as u32)?;
        encode_unsigned(buffer, self.vendor_identifier as u32)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let (object_id, mut pos) = decode_object_identifier(data)?;
        let device_identifier = ObjectIdentifier::from(object_id);
        if device_identifier.object_type != ObjectType::Device {
            return Err(EncodingError::InvalidFormat(format!(
                "I-Am for non-device object {}",
                device_identifier
            )));
        }

        let (max_apdu_length_accepted, consumed) = decode_unsigned(&data[pos..])?;
        pos += consumed;

        let (segmentation, consumed) = decode_enumerated(&data[pos..])?;
        pos += consumed;
        let segmentation_supported =
            Segmentation::try_from(segmentation).map_err(|_| EncodingError::ValueOutOfRange)?;

        let (vendor_identifier, _) = decode_unsigned(&data[pos..])?;
        let vendor_identifier =
            u16::try_from(vendor_identifier).map_err(|_| EncodingError::ValueOutOfRange)?;

        Ok(Self {
            device_identifier,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        })
    }
}

/// Object searched for by Who-Has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoHasObject {
    Identifier(ObjectIdentifier),
    Name(String),
}

/// Who-Has request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoHasRequest {
    pub range: Option<(u32, u32)>,
    pub object: WhoHasObject,
}

impl WhoHasRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_range(buffer, self.range)?;
        match &self.object {
            WhoHasObject::Identifier(id) => {
                let (object_type, instance) = id.raw_parts();
                encode_context_object_id(buffer, 2, object_type, instance)
            }
            WhoHasObject::Name(name) => encode_context_character_string(buffer, 3, name),
        }
    }

    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let (range, pos) = decode_range(data)?;
        let rest = &data[pos..];
        let object = if has_context_tag(rest, 2) {
            let (id, _) = decode_context_object_id(rest, 2)?;
            WhoHasObject::Identifier(id.into())
        } else {
            let (name, _) = decode_context_character_string(rest, 3)?;
            WhoHasObject::Name(name)
        };
        Ok(Self { range, object })
    }

    pub fn matches(&self, device_instance: u32) -> bool {
        self.range
            .map_or(true, |(low, high)| (low..=high).contains(&device_instance))
    }
}

/// I-Have announcement (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHaveRequest {
    pub device_identifier: ObjectIdentifier,
    pub object_identifier: ObjectIdentifier,
    pub object_name: String,
}

impl IHaveRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        let (device_type, device_instance) = self.device_identifier.raw_parts();
        encode_object_identifier(buffer, device_type, device_instance)?;
        let (object_type, instance) = self.object_identifier.raw_parts();
        encode_object_identifier(buffer, object_type, instance)?;
        encode_character_string(buffer, &self.object_name)
    }

    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let (device, mut pos) = decode_object_identifier(data)?;
        let (object, consumed) = decode_object_identifier(&data[pos..])?;
        pos += consumed;
        let (object_name, _) = decode_character_string(&data[pos..])?;
        Ok(Self {
            device_identifier: device.into(),
            object_identifier: object.into(),
            object_name,
        })
    }
}

/// Answers a Who-Is addressed to this device with an I-Am on the requester's network.
pub fn handle_who_is(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    let request = match WhoIsRequest::decode(service_data) {
        Ok(request) => request,
        Err(e) => {
            warn!("dropping malformed Who-Is from {}: {}", src, e);
            return;
        }
    };

    let device = app.device_instance();
    if app.is_client() || !request.matches(device) {
        trace!("Who-Is from {} not for device {}", src, device);
        return;
    }

    if let Err(e) = app.send_i_am(&BacnetAddress::remote_broadcast(src.net)) {
        warn!("failed to answer Who-Is from {}: {}", src, e);
    }
}

/// Records the sender of an I-Am in the address binding cache.
pub fn handle_i_am(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    let i_am = match IAmRequest::decode(service_data) {
        Ok(i_am) => i_am,
        Err(e) => {
            warn!("dropping malformed I-Am from {}: {}", src, e);
            return;
        }
    };

    debug!(
        "I-Am from {}: device {} max APDU {} vendor {}",
        src, i_am.device_identifier.instance, i_am.max_apdu_length_accepted, i_am.vendor_identifier
    );

    if let Err(e) = app.binding().add(
        i_am.device_identifier.instance,
        i_am.max_apdu_length_accepted,
        src,
        false,
    )
    {
        warn!("cannot bind device {} to {}: {}", i_am.device_identifier.instance, src, e);
    }
}

/// Answers a Who-Has for an object this device owns with an I-Have.
pub fn handle_who_has(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    let request = match WhoHasRequest::decode(service_data) {
        Ok(request) => request,
        Err(e) => {
            warn!("dropping malformed Who-Has from {}: {}", src, e);
            return;
        }
    };

    if app.is_client() || !request.matches(app.device_instance()) {
        return;
    }

    let database = app.database();
    let found = match request.object {
        WhoHasObject::Identifier(id) => database.object_name(id).map(|name| (id, name)),
        WhoHasObject::Name(name) => database.find_object_by_name(&name).map(|id| (id, name)),
    };

    if let Some((object_identifier, object_name)) = found {
        let i_have = IHaveRequest {
            device_identifier: ObjectIdentifier::new(ObjectType::Device, app.device_instance()),
            object_identifier,
            object_name,
        };
        if let Err(e) = app.send_i_have(&i_have) {
            warn!("failed to answer Who-Has from {}: {}", src, e);
        }
    }
}

/// I-Have is only logged; nothing in the session core tracks object locations.
pub fn handle_i_have(_app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    match IHaveRequest::decode(service_data) {
        Ok(i_have) => debug!(
            "I-Have from {}: device {} has {} \"{}\"",
            src, i_have.device_identifier.instance, i_have.object_identifier, i_have.object_name
        ),
        Err(e) => warn!("dropping malformed I-Have from {}: {}", src, e),
    }
}

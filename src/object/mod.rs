//! BACnet Objects as Seen by the Session Core
//!
//! The session core does not model building-automation objects itself. Service
//! handlers reach object state through the [`ObjectDatabase`] collaborator,
//! which reads and writes application-encoded property values on behalf of a
//! request. This module defines that contract plus the identifiers it is keyed
//! on.
//!
//! # Object identifiers
//!
//! An object identifier packs a 10-bit object type and a 22-bit instance
//! number. Instance `0x3FFFFF` addressed to a Device object is the wildcard for
//! "whichever device receives this request"; handlers substitute the local
//! device instance before consulting the database.
//!
//! ```rust
//! use bacnet_session::object::{ObjectIdentifier, ObjectType};
//!
//! let device = ObjectIdentifier::new(ObjectType::Device, 123456);
//! assert!(device.is_valid());
//! assert_eq!(u32::from(device), (8 << 22) | 123456);
//! assert_eq!(ObjectIdentifier::from(u32::from(device)), device);
//! ```
//!
//! # Property access
//!
//! Values cross the [`ObjectDatabase`] boundary already encoded with
//! application tags. A read appends the value (or, for an array read without
//! an index, every element) to the output vector; the service handler wraps it
//! in the opening/closing tags of its acknowledgement. Failures are returned
//! as a [`ServiceFailure`] and travel back to the requester as an Error,
//! Reject or Abort PDU.
//!
//! [`database::MemoryDatabase`] is a ready-made implementation backed by a
//! hash map.

pub mod database;

use std::fmt;

use bitflags::bitflags;
use chrono::NaiveDateTime;
use log::{debug, info};

use crate::network::BacnetAddress;
use crate::service::device::{CovNotification, ReinitializedState};
use crate::service::property::RangeSpec;
use crate::service::{ConfirmedServiceChoice, ErrorClass, ErrorCode, ServiceFailure, UnconfirmedServiceChoice};
use crate::{generate_custom_enum, BACNET_MAX_INSTANCE};

pub use database::MemoryDatabase;

generate_custom_enum! {
    /// BACnet object types
    ObjectType {
        AnalogInput = 0,
        AnalogOutput = 1,
        AnalogValue = 2,
        BinaryInput = 3,
        BinaryOutput = 4,
        BinaryValue = 5,
        Calendar = 6,
        Command = 7,
        Device = 8,
        EventEnrollment = 9,
        File = 10,
        Group = 11,
        Loop = 12,
        MultiStateInput = 13,
        MultiStateOutput = 14,
        NotificationClass = 15,
        Program = 16,
        Schedule = 17,
        Averaging = 18,
        MultiStateValue = 19,
        TrendLog = 20,
        LifeSafetyPoint = 21,
        LifeSafetyZone = 22,
        Accumulator = 23,
        PulseConverter = 24,
        EventLog = 25,
        GlobalGroup = 26,
        TrendLogMultiple = 27,
        LoadControl = 28,
        StructuredView = 29,
        AccessDoor = 30,
        NetworkPort = 56,
    },
    u16,
    128..=1023
}

generate_custom_enum! {
    /// BACnet property identifiers used by the session services
    PropertyIdentifier {
        AckedTransitions = 0,
        All = 8,
        ApduSegmentTimeout = 10,
        ApduTimeout = 11,
        ApplicationSoftwareVersion = 12,
        DaylightSavingsStatus = 24,
        Description = 28,
        DeviceAddressBinding = 30,
        EventState = 36,
        FirmwareRevision = 44,
        LocalDate = 56,
        LocalTime = 57,
        Location = 58,
        MaxApduLengthAccepted = 62,
        ModelName = 70,
        NumberOfApduRetries = 73,
        ObjectIdentifier = 75,
        ObjectList = 76,
        ObjectName = 77,
        ObjectType = 79,
        Optional = 80,
        OutOfService = 81,
        PresentValue = 85,
        PriorityArray = 87,
        ProtocolObjectTypesSupported = 96,
        ProtocolServicesSupported = 97,
        ProtocolVersion = 98,
        Reliability = 103,
        RelinquishDefault = 104,
        Required = 105,
        SegmentationSupported = 107,
        StatusFlags = 111,
        SystemStatus = 112,
        Units = 117,
        UtcOffset = 119,
        VendorIdentifier = 120,
        VendorName = 121,
        LogBuffer = 131,
        ProtocolRevision = 139,
        RecordCount = 141,
        DatabaseRevision = 155,
        PropertyList = 371,
    },
    u32,
    512..=4194303
}

/// Object identifier (type + instance number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Instance fits in 22 bits and the type in 10.
    pub fn is_valid(&self) -> bool {
        self.instance <= BACNET_MAX_INSTANCE && u16::from(self.object_type) <= 0x3FF
    }

    /// Device object addressed by the "any device" wildcard instance.
    pub fn is_wildcard_device(&self) -> bool {
        self.object_type == ObjectType::Device && self.instance == BACNET_MAX_INSTANCE
    }

    /// Replaces the wildcard device instance with `device_instance`.
    pub fn resolve_wildcard(self, device_instance: u32) -> Self {
        if self.is_wildcard_device() {
            Self::new(ObjectType::Device, device_instance)
        } else {
            self
        }
    }

    pub fn raw_parts(&self) -> (u16, u32) {
        (self.object_type.into(), self.instance)
    }
}

impl From<(u16, u32)> for ObjectIdentifier {
    fn from((object_type, instance): (u16, u32)) -> Self {
        Self::new(object_type.into(), instance)
    }
}

impl From<u32> for ObjectIdentifier {
    /// Convert from 32-bit object identifier.
    /// See clause 20.2.14 of the BACnet specification.
    fn from(value: u32) -> Self {
        crate::util::decode_object_id(value).into()
    }
}

impl From<ObjectIdentifier> for u32 {
    fn from(value: ObjectIdentifier) -> Self {
        let object_type: u16 = value.object_type.into();
        ((object_type as u32 & 0x3FF) << 22) | (value.instance & BACNET_MAX_INSTANCE)
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Segmentation capability advertised in I-Am
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    NoSegmentation = 3,
}

impl TryFrom<u32> for Segmentation {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::NoSegmentation),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Protocol_Services_Supported bit string of the Device object
    #[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
    pub struct ProtocolServicesSupported: u64 {
        const ACKNOWLEDGE_ALARM = 1 << 0;
        const CONFIRMED_COV_NOTIFICATION = 1 << 1;
        const CONFIRMED_EVENT_NOTIFICATION = 1 << 2;
        const GET_ALARM_SUMMARY = 1 << 3;
        const GET_ENROLLMENT_SUMMARY = 1 << 4;
        const SUBSCRIBE_COV = 1 << 5;
        const ATOMIC_READ_FILE = 1 << 6;
        const ATOMIC_WRITE_FILE = 1 << 7;
        const ADD_LIST_ELEMENT = 1 << 8;
        const REMOVE_LIST_ELEMENT = 1 << 9;
        const CREATE_OBJECT = 1 << 10;
        const DELETE_OBJECT = 1 << 11;
        const READ_PROPERTY = 1 << 12;
        const READ_PROPERTY_MULTIPLE = 1 << 14;
        const WRITE_PROPERTY = 1 << 15;
        const WRITE_PROPERTY_MULTIPLE = 1 << 16;
        const DEVICE_COMMUNICATION_CONTROL = 1 << 17;
        const CONFIRMED_PRIVATE_TRANSFER = 1 << 18;
        const CONFIRMED_TEXT_MESSAGE = 1 << 19;
        const REINITIALIZE_DEVICE = 1 << 20;
        const VT_OPEN = 1 << 21;
        const VT_CLOSE = 1 << 22;
        const VT_DATA = 1 << 23;
        const I_AM = 1 << 26;
        const I_HAVE = 1 << 27;
        const UNCONFIRMED_COV_NOTIFICATION = 1 << 28;
        const UNCONFIRMED_EVENT_NOTIFICATION = 1 << 29;
        const UNCONFIRMED_PRIVATE_TRANSFER = 1 << 30;
        const UNCONFIRMED_TEXT_MESSAGE = 1 << 31;
        const TIME_SYNCHRONIZATION = 1 << 32;
        const WHO_HAS = 1 << 33;
        const WHO_IS = 1 << 34;
        const READ_RANGE = 1 << 35;
        const UTC_TIME_SYNCHRONIZATION = 1 << 36;
        const LIFE_SAFETY_OPERATION = 1 << 37;
        const SUBSCRIBE_COV_PROPERTY = 1 << 38;
        const GET_EVENT_INFORMATION = 1 << 39;
        const WRITE_GROUP = 1 << 40;
    }
}

impl ProtocolServicesSupported {
    /// Number of bits in the encoded bit string for protocol revision 14.
    pub const BIT_LEN: usize = 41;

    pub fn from_confirmed(choice: ConfirmedServiceChoice) -> Self {
        use ConfirmedServiceChoice as C;
        match choice {
            C::AcknowledgeAlarm => Self::ACKNOWLEDGE_ALARM,
            C::ConfirmedCovNotification => Self::CONFIRMED_COV_NOTIFICATION,
            C::ConfirmedEventNotification => Self::CONFIRMED_EVENT_NOTIFICATION,
            C::GetAlarmSummary => Self::GET_ALARM_SUMMARY,
            C::GetEnrollmentSummary => Self::GET_ENROLLMENT_SUMMARY,
            C::SubscribeCov => Self::SUBSCRIBE_COV,
            C::AtomicReadFile => Self::ATOMIC_READ_FILE,
            C::AtomicWriteFile => Self::ATOMIC_WRITE_FILE,
            C::AddListElement => Self::ADD_LIST_ELEMENT,
            C::RemoveListElement => Self::REMOVE_LIST_ELEMENT,
            C::CreateObject => Self::CREATE_OBJECT,
            C::DeleteObject => Self::DELETE_OBJECT,
            C::ReadProperty => Self::READ_PROPERTY,
            C::ReadPropertyMultiple => Self::READ_PROPERTY_MULTIPLE,
            C::WriteProperty => Self::WRITE_PROPERTY,
            C::WritePropertyMultiple => Self::WRITE_PROPERTY_MULTIPLE,
            C::DeviceCommunicationControl => Self::DEVICE_COMMUNICATION_CONTROL,
            C::ConfirmedPrivateTransfer => Self::CONFIRMED_PRIVATE_TRANSFER,
            C::ConfirmedTextMessage => Self::CONFIRMED_TEXT_MESSAGE,
            C::ReinitializeDevice => Self::REINITIALIZE_DEVICE,
            C::VtOpen => Self::VT_OPEN,
            C::VtClose => Self::VT_CLOSE,
            C::VtData => Self::VT_DATA,
            C::ReadRange => Self::READ_RANGE,
            C::LifeSafetyOperation => Self::LIFE_SAFETY_OPERATION,
            C::SubscribeCovProperty => Self::SUBSCRIBE_COV_PROPERTY,
            C::GetEventInformation => Self::GET_EVENT_INFORMATION,
            _ => Self::empty(),
        }
    }

    pub fn from_unconfirmed(choice: UnconfirmedServiceChoice) -> Self {
        use UnconfirmedServiceChoice as U;
        match choice {
            U::IAm => Self::I_AM,
            U::IHave => Self::I_HAVE,
            U::UnconfirmedCovNotification => Self::UNCONFIRMED_COV_NOTIFICATION,
            U::UnconfirmedEventNotification => Self::UNCONFIRMED_EVENT_NOTIFICATION,
            U::UnconfirmedPrivateTransfer => Self::UNCONFIRMED_PRIVATE_TRANSFER,
            U::UnconfirmedTextMessage => Self::UNCONFIRMED_TEXT_MESSAGE,
            U::TimeSynchronization => Self::TIME_SYNCHRONIZATION,
            U::WhoHas => Self::WHO_HAS,
            U::WhoIs => Self::WHO_IS,
            U::UtcTimeSynchronization => Self::UTC_TIME_SYNCHRONIZATION,
            U::WriteGroup => Self::WRITE_GROUP,
            _ => Self::empty(),
        }
    }

    pub fn to_bool_vec(&self) -> Vec<bool> {
        (0..Self::BIT_LEN)
            .map(|i| self.bits() & (1 << i) != 0)
            .collect()
    }
}

/// Object, property and optional array index named by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl PropertyReference {
    pub fn new(object: ObjectIdentifier, property: PropertyIdentifier) -> Self {
        Self {
            object,
            property,
            array_index: None,
        }
    }

    pub fn with_index(mut self, array_index: u32) -> Self {
        self.array_index = Some(array_index);
        self
    }
}

/// Properties an object exposes, split the way ReadPropertyMultiple's
/// Required/Optional selectors need them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyLists {
    pub required: Vec<PropertyIdentifier>,
    pub optional: Vec<PropertyIdentifier>,
}

impl PropertyLists {
    pub fn all(&self) -> impl Iterator<Item = PropertyIdentifier> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }
}

fn unknown_property() -> ServiceFailure {
    ServiceFailure::error(ErrorClass::Property, ErrorCode::UnknownProperty)
}

/// Object database collaborator invoked by the service handlers.
///
/// Implementations are shared between the dispatcher and any threads the
/// application runs, hence `Send + Sync`. No session lock is held while these
/// methods run.
pub trait ObjectDatabase: Send + Sync {
    /// Appends the application-encoded value of `reference` to `out`.
    fn read_property(&self, reference: &PropertyReference, out: &mut Vec<u8>) -> Result<(), ServiceFailure>;

    /// Stores the application-encoded `value` into `reference`.
    fn write_property(
        &self,
        reference: &PropertyReference,
        value: &[u8],
        priority: Option<u8>,
    ) -> Result<(), ServiceFailure>;

    /// Required and optional properties of `object`, `None` if it does not exist.
    fn property_lists(&self, _object: ObjectIdentifier) -> Option<PropertyLists> {
        None
    }

    /// Appends the ReadRange result (flags, item count and item data) for a
    /// list property to `out`.
    fn read_range(
        &self,
        _reference: &PropertyReference,
        _range: &RangeSpec,
        _out: &mut Vec<u8>,
    ) -> Result<(), ServiceFailure> {
        Err(ServiceFailure::error(ErrorClass::Property, ErrorCode::PropertyIsNotAList))
    }

    fn object_name(&self, _object: ObjectIdentifier) -> Option<String> {
        None
    }

    fn find_object_by_name(&self, _name: &str) -> Option<ObjectIdentifier> {
        None
    }

    /// Invoked after a ReinitializeDevice request passed its password check.
    fn reinitialize(&self, state: ReinitializedState) -> Result<(), ServiceFailure> {
        info!("reinitialize requested: {:?}", state);
        Ok(())
    }

    fn synchronize_time(&self, time: NaiveDateTime, utc: bool) {
        info!("time synchronization to {} (utc: {})", time, utc);
    }

    fn cov_notification(&self, src: &BacnetAddress, notification: &CovNotification) {
        debug!(
            "unconfirmed COV from {} for {}: {} values",
            src,
            notification.monitored_object,
            notification.values.len()
        );
    }
}

/// Database with no objects at all. Every read fails with unknown-object.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyDatabase;

impl ObjectDatabase for EmptyDatabase {
    fn read_property(&self, _reference: &PropertyReference, _out: &mut Vec<u8>) -> Result<(), ServiceFailure> {
        Err(ServiceFailure::error(ErrorClass::Object, ErrorCode::UnknownObject))
    }

    fn write_property(
        &self,
        _reference: &PropertyReference,
        _value: &[u8],
        _priority: Option<u8>,
    ) -> Result<(), ServiceFailure> {
        Err(unknown_property())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identifier_packing() {
        let id = ObjectIdentifier::new(ObjectType::AnalogInput, 7);
        assert_eq!(u32::from(id), 7);
        let id = ObjectIdentifier::from(0x0200_0001u32);
        assert_eq!(id.object_type, ObjectType::Device);
        assert_eq!(id.instance, 1);
    }

    #[test]
    fn test_proprietary_object_type() {
        let id = ObjectIdentifier::from((300u16, 5u32));
        assert_eq!(id.object_type, ObjectType::Proprietary(300));
        assert!(id.object_type.is_proprietary());
        assert_eq!(u32::from(id) >> 22, 300);
    }

    #[test]
    fn test_wildcard_device_resolution() {
        let wildcard = ObjectIdentifier::new(ObjectType::Device, BACNET_MAX_INSTANCE);
        assert!(wildcard.is_wildcard_device());
        assert_eq!(wildcard.resolve_wildcard(42).instance, 42);

        let ai = ObjectIdentifier::new(ObjectType::AnalogInput, BACNET_MAX_INSTANCE);
        assert_eq!(ai.resolve_wildcard(42), ai);
    }

    #[test]
    fn test_services_supported_bits() {
        let services = ProtocolServicesSupported::from_confirmed(ConfirmedServiceChoice::ReadRange)
            | ProtocolServicesSupported::from_unconfirmed(UnconfirmedServiceChoice::WhoIs);
        let bits = services.to_bool_vec();
        assert_eq!(bits.len(), ProtocolServicesSupported::BIT_LEN);
        assert!(bits[35]);
        assert!(bits[34]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 2);
    }

    #[test]
    fn test_property_identifier_ranges() {
        assert_eq!(PropertyIdentifier::from(85u32), PropertyIdentifier::PresentValue);
        assert_eq!(PropertyIdentifier::from(600u32), PropertyIdentifier::Proprietary(600));
        assert_eq!(PropertyIdentifier::from(4u32), PropertyIdentifier::Reserved(4));
    }
}

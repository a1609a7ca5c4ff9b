//! BACnet Application Layer Services
//!
//! Service choices, the negative-reply vocabulary (Error, Reject and Abort
//! reasons) and the handler interfaces the dispatcher calls into.
//!
//! # Overview
//!
//! The dispatcher looks up an inbound request's service choice in a
//! [`ServiceTable`]. A confirmed handler writes its acknowledgement into the
//! reply buffer it is given, or returns a [`ServiceFailure`] that the
//! dispatcher turns into an Error, Reject or Abort PDU for the same invoke
//! ID. A choice with no registered handler is answered with
//! Reject(unrecognized-service). Unconfirmed handlers never reply directly.
//!
//! Standard handlers live in the submodules:
//!
//! - [`discovery`]: Who-Is / I-Am and Who-Has / I-Have
//! - [`property`]: ReadProperty, WriteProperty, their Multiple variants and ReadRange
//! - [`device`]: DeviceCommunicationControl, ReinitializeDevice, time
//!   synchronization and unconfirmed COV notifications
//!
//! # Example
//!
//! ```
//! use bacnet_session::service::{ConfirmedServiceChoice, RejectReason, ServiceFailure};
//!
//! assert_eq!(ConfirmedServiceChoice::try_from(12).unwrap(), ConfirmedServiceChoice::ReadProperty);
//! let failure = ServiceFailure::Reject(RejectReason::UnrecognizedService);
//! assert_eq!(failure.to_string(), "rejected: UnrecognizedService");
//! ```

pub mod device;
pub mod discovery;
pub mod property;

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::app::{self, ApplicationLayer, ConfirmedRequest};
use crate::buffer::{BacnetBuf, BufferError};
use crate::encoding::EncodingError;
use crate::generate_custom_enum;
use crate::network::BacnetAddress;
use crate::object::ProtocolServicesSupported;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors raised while building or parsing service productions locally.
///
/// These never reach the wire; a remote peer's negative reply arrives as an
/// [`InvokerEvent`](crate::tsm::InvokerEvent) instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unsupported service choice: {0}")]
    UnsupportedServiceChoice(u8),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
    AtomicReadFile = 6,
    AtomicWriteFile = 7,
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyConditional = 13,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,
    Authenticate = 24,
    RequestKey = 25,
    ReadRange = 26,
    LifeSafetyOperation = 27,
    SubscribeCovProperty = 28,
    GetEventInformation = 29,
    SubscribeCovPropertyMultiple = 30,
    ConfirmedCovNotificationMultiple = 31,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        use ConfirmedServiceChoice::*;
        const ALL: [ConfirmedServiceChoice; 32] = [
            AcknowledgeAlarm,
            ConfirmedCovNotification,
            ConfirmedEventNotification,
            GetAlarmSummary,
            GetEnrollmentSummary,
            SubscribeCov,
            AtomicReadFile,
            AtomicWriteFile,
            AddListElement,
            RemoveListElement,
            CreateObject,
            DeleteObject,
            ReadProperty,
            ReadPropertyConditional,
            ReadPropertyMultiple,
            WriteProperty,
            WritePropertyMultiple,
            DeviceCommunicationControl,
            ConfirmedPrivateTransfer,
            ConfirmedTextMessage,
            ReinitializeDevice,
            VtOpen,
            VtClose,
            VtData,
            Authenticate,
            RequestKey,
            ReadRange,
            LifeSafetyOperation,
            SubscribeCovProperty,
            GetEventInformation,
            SubscribeCovPropertyMultiple,
            ConfirmedCovNotificationMultiple,
        ];
        ALL.get(value as usize)
            .copied()
            .ok_or(ServiceError::UnsupportedServiceChoice(value))
    }
}

/// Unconfirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
    UnconfirmedCovNotificationMultiple = 11,
    UnconfirmedAuditNotification = 12,
    WhoAmI = 13,
    YouAre = 14,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCovNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            11 => Ok(Self::UnconfirmedCovNotificationMultiple),
            12 => Ok(Self::UnconfirmedAuditNotification),
            13 => Ok(Self::WhoAmI),
            14 => Ok(Self::YouAre),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

generate_custom_enum! {
    /// Reject reason codes
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

generate_custom_enum! {
    /// Abort reason codes
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
    },
    u8,
    64..=255
}

generate_custom_enum! {
    /// Error classes
    ErrorClass {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    },
    u16,
    64..=65535
}

generate_custom_enum! {
    /// Error codes
    ErrorCode {
        Other = 0,
        ConfigurationInProgress = 2,
        DeviceBusy = 3,
        InconsistentParameters = 7,
        InvalidDataType = 9,
        MissingRequiredParameter = 16,
        NoSpaceToWriteProperty = 20,
        PropertyIsNotAList = 22,
        OperationalProblem = 25,
        PasswordFailure = 26,
        ReadAccessDenied = 27,
        ServiceRequestDenied = 29,
        Timeout = 30,
        UnknownObject = 31,
        UnknownProperty = 32,
        UnsupportedObjectType = 36,
        ValueOutOfRange = 37,
        WriteAccessDenied = 40,
        InvalidArrayIndex = 42,
        OptionalFunctionalityNotSupported = 45,
        PropertyIsNotAnArray = 50,
        CommunicationDisabled = 83,
    },
    u16,
    256..=65535
}

/// Negative outcome of a confirmed service, sent back instead of an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceFailure {
    #[error("error: {class}/{code}")]
    Error { class: ErrorClass, code: ErrorCode },
    #[error("rejected: {0}")]
    Reject(RejectReason),
    #[error("aborted: {0}")]
    Abort(AbortReason),
}

impl ServiceFailure {
    pub fn error(class: ErrorClass, code: ErrorCode) -> Self {
        ServiceFailure::Error { class, code }
    }

    /// Replaces the contents of `reply` with the PDU that reports this failure.
    ///
    /// Aborts raised by a service handler always carry the server flag.
    pub fn encode_reply(&self, reply: &mut BacnetBuf, invoke_id: u8, service_choice: u8) -> app::Result<()> {
        reply.clear();
        match *self {
            ServiceFailure::Error { class, code } => {
                app::encode_error_apdu(reply, invoke_id, service_choice, class, code)?
            }
            ServiceFailure::Reject(reason) => app::encode_reject_apdu(reply, invoke_id, reason)?,
            ServiceFailure::Abort(reason) => app::encode_abort_apdu(reply, invoke_id, reason, true)?,
        }
        Ok(())
    }
}

/// A reply that no longer fits the negotiated size cannot be segmented.
impl From<BufferError> for ServiceFailure {
    fn from(_: BufferError) -> Self {
        ServiceFailure::Abort(AbortReason::SegmentationNotSupported)
    }
}

impl From<EncodingError> for ServiceFailure {
    fn from(err: EncodingError) -> Self {
        let reason = match err {
            EncodingError::BufferUnderflow => RejectReason::MissingRequiredParameter,
            EncodingError::InvalidTag | EncodingError::UnexpectedTag { .. } => RejectReason::InvalidTag,
            EncodingError::ValueOutOfRange => RejectReason::ParameterOutOfRange,
            EncodingError::InvalidLength | EncodingError::InvalidFormat(_) => {
                RejectReason::InvalidParameterDataType
            }
        };
        ServiceFailure::Reject(reason)
    }
}

/// Fails with Reject(too-many-arguments) unless every request byte was consumed.
pub(crate) fn expect_end(data: &[u8], consumed: usize) -> std::result::Result<(), ServiceFailure> {
    if consumed < data.len() {
        return Err(ServiceFailure::Reject(RejectReason::TooManyArguments));
    }
    Ok(())
}

/// Handler for one confirmed service.
///
/// `reply` is empty and already bounded by the requester's maximum APDU size.
/// On success the handler leaves a complete acknowledgement PDU in it.
pub trait ConfirmedServiceHandler: Send + Sync {
    fn handle(
        &self,
        app: &ApplicationLayer,
        request: &ConfirmedRequest<'_>,
        src: &BacnetAddress,
        reply: &mut BacnetBuf,
    ) -> std::result::Result<(), ServiceFailure>;
}

impl<F> ConfirmedServiceHandler for F
where
    F: Fn(&ApplicationLayer, &ConfirmedRequest<'_>, &BacnetAddress, &mut BacnetBuf) -> std::result::Result<(), ServiceFailure>
        + Send
        + Sync,
{
    fn handle(
        &self,
        app: &ApplicationLayer,
        request: &ConfirmedRequest<'_>,
        src: &BacnetAddress,
        reply: &mut BacnetBuf,
    ) -> std::result::Result<(), ServiceFailure> {
        self(app, request, src, reply)
    }
}

/// Handler for one unconfirmed service. `service_data` follows the choice byte.
pub trait UnconfirmedServiceHandler: Send + Sync {
    fn handle(&self, app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress);
}

impl<F> UnconfirmedServiceHandler for F
where
    F: Fn(&ApplicationLayer, &[u8], &BacnetAddress) + Send + Sync,
{
    fn handle(&self, app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
        self(app, service_data, src)
    }
}

/// Confirmed and unconfirmed dispatch tables.
#[derive(Default, Clone)]
pub struct ServiceTable {
    confirmed: HashMap<ConfirmedServiceChoice, Arc<dyn ConfirmedServiceHandler>>,
    unconfirmed: HashMap<UnconfirmedServiceChoice, Arc<dyn UnconfirmedServiceHandler>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `choice`, or removes the entry for `None`.
    pub fn set_confirmed(
        &mut self,
        choice: ConfirmedServiceChoice,
        handler: Option<Arc<dyn ConfirmedServiceHandler>>,
    ) {
        match handler {
            Some(handler) => self.confirmed.insert(choice, handler),
            None => self.confirmed.remove(&choice),
        };
    }

    pub fn set_unconfirmed(
        &mut self,
        choice: UnconfirmedServiceChoice,
        handler: Option<Arc<dyn UnconfirmedServiceHandler>>,
    ) {
        match handler {
            Some(handler) => self.unconfirmed.insert(choice, handler),
            None => self.unconfirmed.remove(&choice),
        };
    }

    pub fn confirmed(&self, choice: ConfirmedServiceChoice) -> Option<Arc<dyn ConfirmedServiceHandler>> {
        self.confirmed.get(&choice).cloned()
    }

    pub fn unconfirmed(&self, choice: UnconfirmedServiceChoice) -> Option<Arc<dyn UnconfirmedServiceHandler>> {
        self.unconfirmed.get(&choice).cloned()
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.unconfirmed.clear();
    }

    /// Protocol_Services_Supported as implied by the installed handlers.
    pub fn services_supported(&self) -> ProtocolServicesSupported {
        let confirmed = self
            .confirmed
            .keys()
            .map(|choice| ProtocolServicesSupported::from_confirmed(*choice));
        let unconfirmed = self
            .unconfirmed
            .keys()
            .map(|choice| ProtocolServicesSupported::from_unconfirmed(*choice));
        confirmed
            .chain(unconfirmed)
            .fold(ProtocolServicesSupported::empty(), |acc, flag| acc | flag)
    }
}

impl fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTable")
            .field("confirmed", &self.confirmed.keys().collect::<Vec<_>>())
            .field("unconfirmed", &self.unconfirmed.keys().collect::<Vec<_>>())
            .finish()
    }
}

//! BACnet Application Layer Module
//!
//! APDU framing for every PDU type plus the dispatcher that routes received
//! PDUs to service handlers or to the transaction state machine.
//!
//! # Overview
//!
//! - [`Apdu::decode`] classifies a received PDU by the high nibble of its first
//!   byte and borrows the service data from the input.
//! - The `encode_*` functions write the fixed headers and the negative replies
//!   (Error, Reject, Abort) into a [`BacnetBuf`].
//! - [`ApplicationLayer`] owns the dispatch tables, the TSM, the address
//!   binding cache and the DeviceCommunicationControl state of one stack
//!   instance.
//!
//! Segmentation is not supported. A segmented request, complex-ack or
//! segment-ack is answered with Abort(segmentation-not-supported).
//!
//! # APDU Types
//!
//! | nibble | PDU                    | fixed header                                   |
//! |--------|------------------------|------------------------------------------------|
//! | 0      | Confirmed-Request      | `[type|flags][max-segs|max-resp][id][choice]`  |
//! | 1      | Unconfirmed-Request    | `[type][choice]`                               |
//! | 2      | SimpleACK              | `[type][id][choice]`                           |
//! | 3      | ComplexACK             | `[type|flags][id][choice]`                     |
//! | 4      | SegmentACK             | `[type|neg|srv][id][seq][window]`              |
//! | 5      | Error                  | `[type][id][choice][class][code]`              |
//! | 6      | Reject                 | `[type][id][reason]`                           |
//! | 7      | Abort                  | `[type|srv][id][reason]`                       |
//!
//! # Example
//!
//! ```
//! use bacnet_session::app::{encode_confirmed_service_request, Apdu};
//! use bacnet_session::buffer::BacnetBuf;
//!
//! let mut buf = BacnetBuf::new(50);
//! encode_confirmed_service_request(&mut buf, 7, 12).unwrap();
//! assert_eq!(buf.data(), &[0x00, 0x05, 7, 12]);
//!
//! match Apdu::decode(buf.data()).unwrap() {
//!     Apdu::ConfirmedRequest(request) => {
//!         assert_eq!(request.invoke_id, 7);
//!         assert_eq!(request.max_apdu, 1476);
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod dcc;
mod dispatcher;

pub use dispatcher::{ApplicationLayer, DispatchStats, Transmitter};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binding::{BindingConfig, StaticBinding};
use crate::buffer::{BacnetBuf, BufferError};
use crate::encoding::{decode_enumerated, encode_enumerated, extract_constructed, is_opening_tag, EncodingError};
use crate::network::{BacnetAddress, NetworkError};
use crate::service::{AbortReason, ErrorClass, ErrorCode, RejectReason, ServiceError};
use crate::tsm::{TsmConfig, TsmError};
use crate::BACNET_MAX_APDU;
use dcc::CommunicationState;

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApduError>;

/// Errors raised while framing or sending APDUs.
#[derive(Debug, Error)]
pub enum ApduError {
    #[error("communication is {0:?} by DeviceCommunicationControl")]
    CommunicationDisabled(CommunicationState),
    #[error("a request expecting a reply cannot go to broadcast address {0}")]
    BroadcastConfirmed(BacnetAddress),
    #[error("device {0} has no address binding")]
    UnknownDevice(u32),
    #[error("APDU of {len} bytes exceeds the {max_apdu} accepted by device {device}")]
    TooLong { device: u32, len: usize, max_apdu: u32 },
    #[error("malformed APDU: {0}")]
    Malformed(&'static str),
    #[error("unknown APDU type {0}")]
    UnknownType(u8),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Tsm(#[from] TsmError),
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl ApduType {
    /// Type of the PDU starting with `first_octet`.
    pub fn of(first_octet: u8) -> Result<Self> {
        match first_octet >> 4 {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            other => Err(ApduError::UnknownType(other)),
        }
    }

    fn header(self) -> u8 {
        (self as u8) << 4
    }
}

const SEGMENTED_MESSAGE: u8 = 0x08;
const MORE_FOLLOWS: u8 = 0x04;
const SEGMENTED_RESPONSE_ACCEPTED: u8 = 0x02;
const NEGATIVE_ACK: u8 = 0x02;
const SERVER: u8 = 0x01;

/// Decoded Confirmed-Request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedRequest<'a> {
    pub segmented: bool,
    pub more_follows: bool,
    pub segmented_response_accepted: bool,
    /// Segments the requester accepts; 0 when unspecified
    pub max_segments: u32,
    /// Largest reply the requester accepts
    pub max_apdu: usize,
    pub invoke_id: u8,
    pub sequence_number: Option<u8>,
    pub window_size: Option<u8>,
    pub service_choice: u8,
    pub service_data: &'a [u8],
}

/// A received APDU borrowing its payload from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apdu<'a> {
    ConfirmedRequest(ConfirmedRequest<'a>),
    UnconfirmedRequest {
        service_choice: u8,
        service_data: &'a [u8],
    },
    SimpleAck {
        invoke_id: u8,
        service_choice: u8,
    },
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        window_size: Option<u8>,
        service_choice: u8,
        service_data: &'a [u8],
    },
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },
    /// `class` and `code` are `None` when the body does not carry them.
    Error {
        invoke_id: u8,
        service_choice: u8,
        class: Option<ErrorClass>,
        code: Option<ErrorCode>,
    },
    Reject {
        invoke_id: u8,
        reason: RejectReason,
    },
    Abort {
        server: bool,
        invoke_id: u8,
        reason: AbortReason,
    },
}

impl<'a> Apdu<'a> {
    /// Decode APDU from bytes
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        let Some(&first) = data.first() else {
            return Err(ApduError::Malformed("empty APDU"));
        };

        match ApduType::of(first)? {
            ApduType::ConfirmedRequest => {
                if data.len() < 4 {
                    return Err(ApduError::Malformed("confirmed request too short"));
                }
                let segmented = first & SEGMENTED_MESSAGE != 0;
                let mut pos = 3;
                let (sequence_number, window_size) = if segmented {
                    pos += 2;
                    (data.get(3).copied(), data.get(4).copied())
                } else {
                    (None, None)
                };
                let Some(&service_choice) = data.get(pos) else {
                    return Err(ApduError::Malformed("missing service choice"));
                };
                Ok(Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented,
                    more_follows: first & MORE_FOLLOWS != 0,
                    segmented_response_accepted: first & SEGMENTED_RESPONSE_ACCEPTED != 0,
                    max_segments: decode_max_segs(data[1]),
                    max_apdu: decode_max_apdu(data[1]),
                    invoke_id: data[2],
                    sequence_number,
                    window_size,
                    service_choice,
                    service_data: &data[pos + 1..],
                }))
            }

            ApduType::UnconfirmedRequest => {
                if data.len() < 2 {
                    return Err(ApduError::Malformed("unconfirmed request too short"));
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: &data[2..],
                })
            }

            ApduType::SimpleAck => {
                if data.len() < 3 {
                    return Err(ApduError::Malformed("simple-ack too short"));
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::ComplexAck => {
                if data.len() < 3 {
                    return Err(ApduError::Malformed("complex-ack too short"));
                }
                let segmented = first & SEGMENTED_MESSAGE != 0;
                let mut pos = 2;
                let (sequence_number, window_size) = if segmented {
                    pos += 2;
                    (data.get(2).copied(), data.get(3).copied())
                } else {
                    (None, None)
                };
                let Some(&service_choice) = data.get(pos) else {
                    return Err(ApduError::Malformed("missing service choice"));
                };
                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows: first & MORE_FOLLOWS != 0,
                    invoke_id: data[1],
                    sequence_number,
                    window_size,
                    service_choice,
                    service_data: &data[pos + 1..],
                })
            }

            ApduType::SegmentAck => {
                if data.len() != 4 {
                    return Err(ApduError::Malformed("segment-ack must be 4 bytes"));
                }
                Ok(Apdu::SegmentAck {
                    negative: first & NEGATIVE_ACK != 0,
                    server: first & SERVER != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    window_size: data[3],
                })
            }

            ApduType::Error => {
                if data.len() < 3 {
                    return Err(ApduError::Malformed("error PDU too short"));
                }
                let (class, code) = decode_error_body(&data[3..]);
                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    class,
                    code,
                })
            }

            ApduType::Reject => {
                if data.len() != 3 {
                    return Err(ApduError::Malformed("reject PDU must be 3 bytes"));
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reason: RejectReason::from(data[2]),
                })
            }

            ApduType::Abort => {
                if data.len() != 3 {
                    return Err(ApduError::Malformed("abort PDU must be 3 bytes"));
                }
                Ok(Apdu::Abort {
                    server: first & SERVER != 0,
                    invoke_id: data[1],
                    reason: AbortReason::from(data[2]),
                })
            }
        }
    }

    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest(_) => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }
}

/// Error class and code, plain or wrapped in context tag 0 the way
/// WritePropertyMultiple and friends report them.
fn decode_error_body(body: &[u8]) -> (Option<ErrorClass>, Option<ErrorCode>) {
    let body = if is_opening_tag(body, 0) {
        extract_constructed(body, 0).map_or(&[][..], |(inner, _)| inner)
    } else {
        body
    };
    let Ok((class, pos)) = decode_enumerated(body) else {
        return (None, None);
    };
    let code = decode_enumerated(&body[pos..])
        .ok()
        .and_then(|(code, _)| u16::try_from(code).ok())
        .map(ErrorCode::from);
    (u16::try_from(class).ok().map(ErrorClass::from), code)
}

/// Packs the max-segments and max-APDU fields of a Confirmed-Request.
pub fn encode_max_segs_max_apdu(max_segs: u32, max_apdu: usize) -> u8 {
    let segs = match max_segs {
        0..=1 => 0x00,
        2..=3 => 0x10,
        4..=7 => 0x20,
        8..=15 => 0x30,
        16..=31 => 0x40,
        32..=63 => 0x50,
        64 => 0x60,
        _ => 0x70,
    };
    let apdu = match max_apdu {
        0..=50 => 0x00,
        51..=128 => 0x01,
        129..=206 => 0x02,
        207..=480 => 0x03,
        481..=1024 => 0x04,
        _ => 0x05,
    };
    segs | apdu
}

/// Segments accepted; 0 for unspecified, 65 for "more than 64".
pub fn decode_max_segs(octet: u8) -> u32 {
    match octet & 0x70 {
        0x10 => 2,
        0x20 => 4,
        0x30 => 8,
        0x40 => 16,
        0x50 => 32,
        0x60 => 64,
        0x70 => 65,
        _ => 0,
    }
}

/// Largest APDU accepted; reserved codes decode as the 50-byte minimum.
pub fn decode_max_apdu(octet: u8) -> usize {
    match octet & 0x0F {
        1 => 128,
        2 => 206,
        3 => 480,
        4 => 1024,
        5 => 1476,
        _ => 50,
    }
}

/// Appends the 4-byte Confirmed-Request header.
pub fn encode_confirmed_service_request(buf: &mut BacnetBuf, invoke_id: u8, service_choice: u8) -> std::result::Result<(), BufferError> {
    buf.put_slice(&[
        ApduType::ConfirmedRequest.header(),
        encode_max_segs_max_apdu(0, BACNET_MAX_APDU),
        invoke_id,
        service_choice,
    ])
}

pub fn encode_unconfirmed_request(buf: &mut BacnetBuf, service_choice: u8) -> std::result::Result<(), BufferError> {
    buf.put_slice(&[ApduType::UnconfirmedRequest.header(), service_choice])
}

pub fn encode_simple_ack(buf: &mut BacnetBuf, invoke_id: u8, service_choice: u8) -> std::result::Result<(), BufferError> {
    buf.put_slice(&[ApduType::SimpleAck.header(), invoke_id, service_choice])
}

/// Appends an unsegmented ComplexACK header; the service ack follows.
pub fn encode_complex_ack_header(buf: &mut BacnetBuf, invoke_id: u8, service_choice: u8) -> std::result::Result<(), BufferError> {
    buf.put_slice(&[ApduType::ComplexAck.header(), invoke_id, service_choice])
}

pub fn encode_error_apdu(
    buf: &mut BacnetBuf,
    invoke_id: u8,
    service_choice: u8,
    class: ErrorClass,
    code: ErrorCode,
) -> Result<()> {
    let mut pdu = vec![ApduType::Error.header(), invoke_id, service_choice];
    encode_enumerated(&mut pdu, u16::from(class) as u32)?;
    encode_enumerated(&mut pdu, u16::from(code) as u32)?;
    buf.put_slice(&pdu)?;
    Ok(())
}

pub fn encode_reject_apdu(buf: &mut BacnetBuf, invoke_id: u8, reason: RejectReason) -> std::result::Result<(), BufferError> {
    buf.put_slice(&[ApduType::Reject.header(), invoke_id, u8::from(reason)])
}

/// `server` is set when the abort answers a request this node received.
pub fn encode_abort_apdu(
    buf: &mut BacnetBuf,
    invoke_id: u8,
    reason: AbortReason,
    server: bool,
) -> std::result::Result<(), BufferError> {
    let mut header = ApduType::Abort.header();
    if server {
        header |= SERVER;
    }
    buf.put_slice(&[header, invoke_id, u8::from(reason)])
}

/// Identity and policy of the local device
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceConfig {
    #[cfg_attr(feature = "serde", serde(rename = "Device_Id"))]
    pub device_instance: u32,
    #[cfg_attr(feature = "serde", serde(rename = "Vendor_Id"))]
    pub vendor_identifier: u16,
    /// Client nodes only listen for I-Am and I-Have
    #[cfg_attr(feature = "serde", serde(rename = "Client_Device"))]
    pub is_client: bool,
    /// Required by DeviceCommunicationControl when set
    #[cfg_attr(feature = "serde", serde(rename = "DCC_Password"))]
    pub dcc_password: Option<String>,
    /// Required by ReinitializeDevice when set
    #[cfg_attr(feature = "serde", serde(rename = "Reinitialize_Password"))]
    pub reinitialize_password: Option<String>,
    #[cfg_attr(feature = "serde", serde(rename = "Static_Bindings"))]
    pub static_bindings: Vec<StaticBinding>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_instance: 260001,
            vendor_identifier: 260,
            is_client: false,
            dcc_password: None,
            reinitialize_password: None,
            static_bindings: Vec::new(),
        }
    }
}

/// Everything needed to build an [`ApplicationLayer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StackConfig {
    #[cfg_attr(feature = "serde", serde(rename = "TSM"))]
    pub tsm: TsmConfig,
    #[cfg_attr(feature = "serde", serde(rename = "Address_Cache"))]
    pub binding: BindingConfig,
    #[cfg_attr(feature = "serde", serde(rename = "Device"))]
    pub device: DeviceConfig,
}

#![doc = include_str!("../README.md")]

pub mod app;
pub mod binding;
pub mod buffer;
pub mod encoding;
pub mod network;
pub mod object;
pub mod service;
pub mod tsm;
pub mod util;

pub use app::{ApduError, ApduType, ApplicationLayer, DeviceConfig, StackConfig};
pub use binding::{AddressBindingCache, BindingConfig};
pub use buffer::{BacnetBuf, BufferError};
pub use encoding::{ApplicationTag, EncodingError};
pub use network::{BacnetAddress, NetworkLayer, NetworkPriority};
pub use object::{ObjectDatabase, ObjectIdentifier, ObjectType};
pub use service::{ConfirmedServiceChoice, ServiceFailure, UnconfirmedServiceChoice};
pub use tsm::{InvokeId, Invoker, InvokerEvent, Tsm, TsmConfig, TsmError};

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_PROTOCOL_REVISION: u8 = 14;

/// Largest APDU this stack sends or accepts (an ISO 8802-3 frame).
pub const BACNET_MAX_APDU: usize = 1476;
/// Smallest APDU every BACnet device must accept.
pub const BACNET_MIN_APDU: usize = 50;
/// Largest valid object instance number; also the "unknown device" wildcard.
pub const BACNET_MAX_INSTANCE: u32 = 0x3F_FFFF;
/// Network number addressing every network.
pub const BACNET_BROADCAST_NETWORK: u16 = 0xFFFF;

//! BACnet Network Layer Boundary
//!
//! The session core does not route or frame packets itself. It hands finished
//! APDUs to a [`NetworkLayer`] implementation together with the destination
//! [`BacnetAddress`], the message priority and the data-expecting-reply flag.
//! This module defines that boundary plus the addressing types every other
//! module keys on.
//!
//! # Addressing
//!
//! A BACnet address is a network number and a MAC of up to [`MAX_MAC_LEN`]
//! bytes. A zero-length MAC or the network number `0xFFFF` denotes a
//! broadcast. Address equality is the correlation key for transactions, so
//! unused MAC bytes are always zero.
//!
//! # Example
//!
//! ```
//! use bacnet_session::network::BacnetAddress;
//!
//! let peer = BacnetAddress::new(0, &[192, 168, 1, 10, 0xBA, 0xC0]).unwrap();
//! assert!(!peer.is_broadcast());
//! assert!(BacnetAddress::remote_broadcast(5).is_broadcast());
//! ```

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{buffer::BacnetBuf, buffer::BufferError, BACNET_BROADCAST_NETWORK, BACNET_PROTOCOL_VERSION};

/// Longest MAC address carried in a BACnet address.
pub const MAX_MAC_LEN: usize = 7;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("MAC address of {0} bytes is longer than 7")]
    InvalidMacLength(usize),
    #[error("destination {0} is unreachable")]
    Unreachable(BacnetAddress),
    #[error("network layer is not running")]
    Down,
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network number plus MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "AddressRepr", into = "AddressRepr"))]
pub struct BacnetAddress {
    /// Network number (0 = local network, 65535 = broadcast)
    pub net: u16,
    len: u8,
    mac: [u8; MAX_MAC_LEN],
}

impl BacnetAddress {
    pub fn new(net: u16, mac: &[u8]) -> Result<Self> {
        if mac.len() > MAX_MAC_LEN {
            return Err(NetworkError::InvalidMacLength(mac.len()));
        }
        let mut bytes = [0u8; MAX_MAC_LEN];
        bytes[..mac.len()].copy_from_slice(mac);
        Ok(Self {
            net,
            len: mac.len() as u8,
            mac: bytes,
        })
    }

    /// Station on the directly attached network.
    pub fn local(mac: &[u8]) -> Result<Self> {
        Self::new(0, mac)
    }

    pub fn global_broadcast() -> Self {
        Self::remote_broadcast(BACNET_BROADCAST_NETWORK)
    }

    /// Broadcast on one remote network (or the local one for `0`).
    pub fn remote_broadcast(net: u16) -> Self {
        Self {
            net,
            len: 0,
            mac: [0; MAX_MAC_LEN],
        }
    }

    pub fn mac(&self) -> &[u8] {
        &self.mac[..self.len as usize]
    }

    /// True for any address that does not name a single station.
    pub fn is_broadcast(&self) -> bool {
        self.net == BACNET_BROADCAST_NETWORK || self.len == 0
    }

    pub fn is_local(&self) -> bool {
        self.net == 0
    }
}

/// Serialized form of [`BacnetAddress`]; deserializing goes through
/// [`BacnetAddress::new`].
#[cfg(feature = "serde")]
#[derive(Serialize, Deserialize)]
struct AddressRepr {
    net: u16,
    #[serde(default)]
    mac: Vec<u8>,
}

#[cfg(feature = "serde")]
impl TryFrom<AddressRepr> for BacnetAddress {
    type Error = NetworkError;

    fn try_from(repr: AddressRepr) -> Result<Self> {
        BacnetAddress::new(repr.net, &repr.mac)
    }
}

#[cfg(feature = "serde")]
impl From<BacnetAddress> for AddressRepr {
    fn from(address: BacnetAddress) -> Self {
        AddressRepr {
            net: address.net,
            mac: address.mac().to_vec(),
        }
    }
}

impl fmt::Debug for BacnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BacnetAddress({})", self)
    }
}

impl fmt::Display for BacnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.net)?;
        if self.len == 0 {
            return f.write_str("*");
        }
        for (i, byte) in self.mac().iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Network priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum NetworkPriority {
    /// Life Safety messages (highest priority)
    LifeSafety = 3,
    /// Critical Equipment messages
    CriticalEquipment = 2,
    /// Urgent messages
    Urgent = 1,
    /// Normal messages (lowest priority)
    #[default]
    Normal = 0,
}

impl NetworkPriority {
    /// Convert to NPDU priority bits
    pub fn to_bits(self) -> u8 {
        self as u8
    }

    /// Create from NPDU priority bits
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            3 => NetworkPriority::LifeSafety,
            2 => NetworkPriority::CriticalEquipment,
            1 => NetworkPriority::Urgent,
            _ => NetworkPriority::Normal,
        }
    }
}

/// Collaborator that frames and transmits APDUs.
///
/// Implementations must not block on I/O; sending is expected to enqueue.
/// The buffer's headroom is available for prepending the NPDU and datalink
/// headers.
pub trait NetworkLayer: Send + Sync {
    fn send_pdu(
        &self,
        dst: &BacnetAddress,
        apdu: &mut BacnetBuf,
        priority: NetworkPriority,
        data_expecting_reply: bool,
    ) -> Result<()>;
}

/// Prepends an application-message NPDU header addressed to `dst`.
///
/// Local stations get the short two-byte header; anything on another network
/// (including global broadcast) carries DNET/DLEN/DADR and a hop count.
pub fn prepend_npdu(
    buf: &mut BacnetBuf,
    dst: &BacnetAddress,
    priority: NetworkPriority,
    data_expecting_reply: bool,
) -> Result<()> {
    let mut control = priority.to_bits();
    if data_expecting_reply {
        control |= 0x04;
    }

    if dst.is_local() {
        let header = buf.push(2)?;
        header[0] = BACNET_PROTOCOL_VERSION;
        header[1] = control;
        return Ok(());
    }

    let mac = dst.mac();
    let header = buf.push(2 + 3 + mac.len() + 1)?;
    header[0] = BACNET_PROTOCOL_VERSION;
    header[1] = control | 0x20;
    header[2..4].copy_from_slice(&dst.net.to_be_bytes());
    header[4] = mac.len() as u8;
    header[5..5 + mac.len()].copy_from_slice(mac);
    header[5 + mac.len()] = 255;
    Ok(())
}

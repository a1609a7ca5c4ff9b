//! Address Binding Cache
//!
//! Maps device instances to the network address they answer on, together
//! with the largest APDU the device accepts, and back again. The cache is
//! what lets a confirmed request be addressed by device instance.
//!
//! # Entries
//!
//! - **Static** entries come from configuration. They never expire, are never
//!   evicted and cannot be rebound by traffic.
//! - **Dynamic** entries are learned from I-Am. They live for the configured
//!   TTL, are kept in least-recently-used order and the oldest one makes room
//!   when the cache is full.
//!
//! # Who-Is probing
//!
//! A lookup that misses, or hits an expired entry, asks the network with a
//! Who-Is for that single instance. A hit older than half the TTL refreshes
//! the binding the same way while still answering from the cache. Probes are
//! throttled per device: the first goes out immediately, repeats wait at least
//! [`WHOIS_MIN_INTERVAL`] and back off to half the TTL. Repeats are sent as a
//! global broadcast.
//!
//! Probes are handed to a [`WhoIsSender`] after the cache lock is released.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bacnet_session::binding::{AddressBindingCache, BindingConfig};
//! use bacnet_session::network::BacnetAddress;
//! use bacnet_session::util::ManualClock;
//!
//! let cache = AddressBindingCache::new(BindingConfig::default(), 1, Arc::new(ManualClock::new()));
//! let addr = BacnetAddress::local(&[10, 0, 0, 7, 0xBA, 0xC0]).unwrap();
//! cache.add(42, 1476, &addr, false).unwrap();
//! assert_eq!(cache.query_address_from_device(42), Some((addr, 1476)));
//! assert_eq!(cache.query_device_from_address(&addr), Some((42, 1476)));
//! ```

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, error, trace, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::{encode_object_identifier, encode_octet_string, encode_unsigned, EncodingError};
use crate::network::BacnetAddress;
use crate::object::ObjectType;
use crate::util::{lock, Backoff, Clock};
use crate::{BACNET_BROADCAST_NETWORK, BACNET_MAX_INSTANCE};

/// Shortest interval between two Who-Is probes for the same device.
pub const WHOIS_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Result type for address cache operations
pub type Result<T> = std::result::Result<T, BindingError>;

#[derive(Debug, Error, PartialEq)]
pub enum BindingError {
    #[error("device instance {0} out of range")]
    InvalidDevice(u32),
    #[error("address {0} belongs to a static binding")]
    StaticAddress(BacnetAddress),
    #[error("device {0} has a static binding")]
    StaticDevice(u32),
    #[error("device {0} is not bound")]
    NotFound(u32),
    #[error("address bindings need {needed} bytes, {available} available")]
    TooLarge { needed: usize, available: usize },
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Address cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BindingConfig {
    /// Lifetime of a dynamic binding in seconds
    #[cfg_attr(feature = "serde", serde(rename = "Address_Cache_TTL"))]
    pub ttl: u32,
    /// Dynamic entries kept before the least recently used is evicted
    #[cfg_attr(feature = "serde", serde(rename = "Max_Address_Cache"))]
    pub max_entries: usize,
    /// Devices with an outstanding Who-Is probe
    #[cfg_attr(feature = "serde", serde(rename = "Max_WhoIs_Cache"))]
    pub max_whois_entries: usize,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            ttl: 300,
            max_entries: 512,
            max_whois_entries: 512,
        }
    }
}

impl BindingConfig {
    pub const MIN_TTL: u32 = 2 * WHOIS_MIN_INTERVAL.as_secs() as u32;
    pub const MIN_ENTRIES: usize = 64;

    /// Raises out-of-range values to their minimum.
    pub fn sanitized(mut self) -> Self {
        if self.ttl < Self::MIN_TTL {
            warn!("Address_Cache_TTL {} too small, using {}", self.ttl, Self::MIN_TTL);
            self.ttl = Self::MIN_TTL;
        }
        if self.max_entries < Self::MIN_ENTRIES {
            warn!("Max_Address_Cache {} too small, using {}", self.max_entries, Self::MIN_ENTRIES);
            self.max_entries = Self::MIN_ENTRIES;
        }
        if self.max_whois_entries < Self::MIN_ENTRIES {
            warn!(
                "Max_WhoIs_Cache {} too small, using {}",
                self.max_whois_entries,
                Self::MIN_ENTRIES
            );
            self.max_whois_entries = Self::MIN_ENTRIES;
        }
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl as u64)
    }
}

/// Binding supplied by configuration instead of learned from I-Am.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StaticBinding {
    pub device_id: u32,
    pub address: BacnetAddress,
    pub max_apdu: u32,
}

/// Sends the Who-Is probes the cache decides on.
pub trait WhoIsSender: Send + Sync {
    /// Asks `net` (0xFFFF for every network) where `device_id` lives.
    fn send_who_is(&self, net: u16, device_id: u32);
}

#[derive(Debug, Clone)]
struct Entry {
    address: BacnetAddress,
    max_apdu: u32,
    is_static: bool,
    updated: Duration,
    /// Key in `Bindings::lru`; unused for static entries
    last_use: u64,
}

#[derive(Debug, Default)]
struct Bindings {
    by_device: HashMap<u32, Entry>,
    by_address: HashMap<BacnetAddress, u32>,
    /// Static devices in insertion order
    statics: Vec<u32>,
    /// Dynamic devices by last use, oldest first
    lru: BTreeMap<u64, u32>,
    use_counter: u64,
}

impl Bindings {
    fn next_use(&mut self) -> u64 {
        self.use_counter += 1;
        self.use_counter
    }

    fn touch(&mut self, device_id: u32) {
        let stamp = self.next_use();
        let Some(entry) = self.by_device.get_mut(&device_id) else {
            return;
        };
        if entry.is_static {
            return;
        }
        self.lru.remove(&entry.last_use);
        entry.last_use = stamp;
        self.lru.insert(stamp, device_id);
    }

    /// Dynamic devices, most recently used first.
    fn dynamic(&self) -> impl Iterator<Item = &u32> {
        self.lru.values().rev()
    }

    fn remove(&mut self, device_id: u32) -> Option<Entry> {
        let entry = self.by_device.remove(&device_id)?;
        if self.by_address.get(&entry.address) == Some(&device_id) {
            self.by_address.remove(&entry.address);
        }
        if entry.is_static {
            self.statics.retain(|&d| d != device_id);
        } else {
            self.lru.remove(&entry.last_use);
        }
        Some(entry)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    last: Duration,
    interval: Duration,
}

#[derive(Debug, Default)]
struct WhoIsThrottle {
    probes: HashMap<u32, Probe>,
    /// Most recently probed first
    order: VecDeque<u32>,
}

impl WhoIsThrottle {
    fn forget(&mut self, device_id: u32) {
        if self.probes.remove(&device_id).is_some() {
            self.order.retain(|&d| d != device_id);
        }
    }
}

/// Device instance to address cache with LRU eviction and static pinning.
pub struct AddressBindingCache {
    config: BindingConfig,
    local_device: u32,
    clock: Arc<dyn Clock>,
    bindings: Mutex<Bindings>,
    throttle: Mutex<WhoIsThrottle>,
    backoff: Backoff,
    who_is: Mutex<Option<Arc<dyn WhoIsSender>>>,
}

impl AddressBindingCache {
    /// `local_device` is this node's own instance, which is never looked up.
    pub fn new(config: BindingConfig, local_device: u32, clock: Arc<dyn Clock>) -> Self {
        let config = config.sanitized();
        let backoff = Backoff::new(WHOIS_MIN_INTERVAL, config.ttl() / 2);
        Self {
            config,
            local_device,
            clock,
            bindings: Mutex::new(Bindings::default()),
            throttle: Mutex::new(WhoIsThrottle::default()),
            backoff,
            who_is: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    /// Installs the sink for Who-Is probes. Without one, lookups still
    /// update the throttle but nothing is sent.
    pub fn set_who_is_sender(&self, sender: Arc<dyn WhoIsSender>) {
        *lock(&self.who_is) = Some(sender);
    }

    fn expired(&self, entry: &Entry, now: Duration) -> bool {
        !entry.is_static && now.saturating_sub(entry.updated) >= self.config.ttl()
    }

    /// Binds `device_id` to `address`.
    ///
    /// A dynamic binding for a device that is already known refreshes it. If
    /// the address currently belongs to another dynamic device, that binding
    /// moves to `device_id`. Static bindings and addresses owned by one are
    /// never changed by a dynamic add.
    pub fn add(&self, device_id: u32, max_apdu: u32, address: &BacnetAddress, is_static: bool) -> Result<()> {
        if device_id >= BACNET_MAX_INSTANCE {
            return Err(BindingError::InvalidDevice(device_id));
        }
        let max_apdu = max_apdu.min(u16::MAX as u32);
        let now = self.clock.now();

        {
            let mut bindings = lock(&self.bindings);

            if let Some(existing) = bindings.by_device.get(&device_id) {
                if existing.is_static {
                    if existing.max_apdu != max_apdu || existing.address != *address {
                        error!("device {} has a static binding to {}", device_id, existing.address);
                    }
                    return Err(BindingError::StaticDevice(device_id));
                }
            }

            match bindings.by_address.get(address).copied() {
                Some(owner) if owner != device_id => {
                    if bindings.by_device.get(&owner).is_some_and(|e| e.is_static) {
                        error!("address {} belongs to static device {}", address, owner);
                        return Err(BindingError::StaticAddress(*address));
                    }
                    warn!("address {} moves from device {} to {}", address, owner, device_id);
                    bindings.remove(owner);
                }
                _ => {}
            }

            if let Some(previous) = bindings.remove(device_id) {
                if previous.address != *address {
                    warn!("device {} moved from {} to {}", device_id, previous.address, address);
                }
            } else if !is_static && bindings.lru.len() >= self.config.max_entries {
                if let Some((_, &evicted)) = bindings.lru.first_key_value() {
                    debug!("evicting least recently used binding for device {}", evicted);
                    bindings.remove(evicted);
                }
            }

            let last_use = bindings.next_use();
            bindings.by_device.insert(
                device_id,
                Entry {
                    address: *address,
                    max_apdu,
                    is_static,
                    updated: now,
                    last_use,
                },
            );
            bindings.by_address.insert(*address, device_id);
            if is_static {
                bindings.statics.push(device_id);
            } else {
                bindings.lru.insert(last_use, device_id);
            }
        }

        if !is_static {
            lock(&self.throttle).forget(device_id);
        }
        trace!("bound device {} to {} (max APDU {})", device_id, address, max_apdu);
        Ok(())
    }

    /// Adds every configured static binding, logging the ones that fail.
    pub fn add_static(&self, bindings: &[StaticBinding]) {
        for binding in bindings {
            if let Err(e) = self.add(binding.device_id, binding.max_apdu, &binding.address, true) {
                error!("static binding for device {} rejected: {}", binding.device_id, e);
            }
        }
    }

    pub fn delete(&self, device_id: u32) -> Result<()> {
        if device_id >= BACNET_MAX_INSTANCE {
            return Err(BindingError::InvalidDevice(device_id));
        }
        lock(&self.bindings)
            .remove(device_id)
            .map(|_| ())
            .ok_or(BindingError::NotFound(device_id))
    }

    /// Drops every binding and every pending probe.
    pub fn destroy(&self) {
        lock(&self.bindings).clear();
        let mut throttle = lock(&self.throttle);
        throttle.probes.clear();
        throttle.order.clear();
    }

    /// Address and max APDU of `device_id`, probing the network when the
    /// binding is missing, expired or getting old.
    pub fn query_address_from_device(&self, device_id: u32) -> Option<(BacnetAddress, u32)> {
        if device_id >= BACNET_MAX_INSTANCE {
            error!("device instance {} out of range", device_id);
            return None;
        }
        if device_id == self.local_device {
            error!("cannot look up our own device {}", device_id);
            return None;
        }

        let now = self.clock.now();
        let mut probe = None;
        let found = {
            let mut bindings = lock(&self.bindings);
            match bindings.by_device.get(&device_id).cloned() {
                Some(entry) if entry.is_static => Some((entry.address, entry.max_apdu)),
                Some(entry) if !self.expired(&entry, now) => {
                    bindings.touch(device_id);
                    if now.saturating_sub(entry.updated) > self.config.ttl() / 2 {
                        probe = Some(entry.address.net);
                    }
                    Some((entry.address, entry.max_apdu))
                }
                Some(entry) => {
                    debug!("binding for device {} expired", device_id);
                    bindings.remove(device_id);
                    probe = Some(entry.address.net);
                    None
                }
                None => {
                    probe = Some(BACNET_BROADCAST_NETWORK);
                    None
                }
            }
        };

        if let Some(net) = probe {
            self.probe(device_id, net);
        }
        found
    }

    /// Device instance and max APDU bound to `address`. Never probes.
    pub fn query_device_from_address(&self, address: &BacnetAddress) -> Option<(u32, u32)> {
        let now = self.clock.now();
        let mut bindings = lock(&self.bindings);
        let device_id = *bindings.by_address.get(address)?;
        let entry = bindings.by_device.get(&device_id)?.clone();

        if entry.is_static {
            return Some((device_id, entry.max_apdu));
        }
        if self.expired(&entry, now) {
            bindings.remove(device_id);
            return None;
        }
        bindings.touch(device_id);
        Some((device_id, entry.max_apdu))
    }

    /// Bindings on `net` (0xFFFF for all), static first, at most `limit`.
    /// Expired dynamic entries met on the way are dropped; nothing is promoted.
    pub fn get_by_net(&self, net: u16, limit: usize) -> Vec<(BacnetAddress, u32)> {
        let now = self.clock.now();
        let mut bindings = lock(&self.bindings);
        let matches = |entry: &Entry| net == BACNET_BROADCAST_NETWORK || entry.address.net == net;

        let mut found: Vec<(BacnetAddress, u32)> = bindings
            .statics
            .iter()
            .filter_map(|d| bindings.by_device.get(d))
            .filter(|e| matches(e))
            .map(|e| (e.address, e.max_apdu))
            .take(limit)
            .collect();

        let mut expired = Vec::new();
        for device_id in bindings.dynamic() {
            if found.len() >= limit {
                break;
            }
            let Some(entry) = bindings.by_device.get(device_id) else {
                continue;
            };
            if !matches(entry) {
                continue;
            }
            if self.expired(entry, now) {
                expired.push(*device_id);
                continue;
            }
            found.push((entry.address, entry.max_apdu));
        }
        for device_id in expired {
            bindings.remove(device_id);
        }
        found
    }

    /// Appends the Device_Address_Binding list: for every live binding the
    /// device object identifier, network number and MAC. Fails if the list
    /// would exceed `limit` bytes.
    pub fn encode_address_binding(&self, out: &mut Vec<u8>, limit: usize) -> Result<()> {
        let now = self.clock.now();
        let mut bindings = lock(&self.bindings);

        let expired: Vec<u32> = bindings
            .dynamic()
            .copied()
            .filter(|d| bindings.by_device.get(d).is_some_and(|e| self.expired(e, now)))
            .collect();
        for device_id in expired {
            bindings.remove(device_id);
        }

        let start = out.len();
        for device_id in bindings.statics.iter().chain(bindings.dynamic()) {
            let Some(entry) = bindings.by_device.get(device_id) else {
                continue;
            };
            encode_object_identifier(out, ObjectType::Device.into(), *device_id)?;
            encode_unsigned(out, entry.address.net as u32)?;
            encode_octet_string(out, entry.address.mac())?;
            if out.len() - start > limit {
                let needed = out.len() - start;
                out.truncate(start);
                return Err(BindingError::TooLarge {
                    needed,
                    available: limit,
                });
            }
        }
        Ok(())
    }

    /// Number of (static, dynamic) bindings.
    pub fn len(&self) -> (usize, usize) {
        let bindings = lock(&self.bindings);
        (bindings.statics.len(), bindings.lru.len())
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.bindings).by_device.is_empty()
    }

    fn probe(&self, device_id: u32, net: u16) {
        let now = self.clock.now();
        let net = {
            let mut throttle = lock(&self.throttle);
            let net = match throttle.probes.get(&device_id).copied() {
                None => {
                    if throttle.probes.len() >= self.config.max_whois_entries {
                        if let Some(oldest) = throttle.order.pop_back() {
                            throttle.probes.remove(&oldest);
                        }
                    }
                    throttle.probes.insert(
                        device_id,
                        Probe {
                            last: now,
                            interval: WHOIS_MIN_INTERVAL,
                        },
                    );
                    net
                }
                Some(probe) => {
                    let quiet_for = now.saturating_sub(probe.last);
                    if quiet_for < probe.interval {
                        trace!("Who-Is for device {} throttled", device_id);
                        return;
                    }
                    throttle.probes.insert(
                        device_id,
                        Probe {
                            last: now,
                            interval: self.backoff.next(probe.interval, quiet_for),
                        },
                    );
                    throttle.order.retain(|&d| d != device_id);
                    BACNET_BROADCAST_NETWORK
                }
            };
            throttle.order.push_front(device_id);
            net
        };

        let sender = lock(&self.who_is).clone();
        match sender {
            Some(sender) => {
                debug!("Who-Is for device {} on network {}", device_id, net);
                sender.send_who_is(net, device_id);
            }
            None => trace!("no Who-Is sender installed, device {} not probed", device_id),
        }
    }
}

impl std::fmt::Debug for AddressBindingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (statics, dynamic) = self.len();
        f.debug_struct("AddressBindingCache")
            .field("config", &self.config)
            .field("static", &statics)
            .field("dynamic", &dynamic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;

    #[derive(Default)]
    struct Probes(Mutex<Vec<(u16, u32)>>);

    impl WhoIsSender for Probes {
        fn send_who_is(&self, net: u16, device_id: u32) {
            self.0.lock().unwrap().push((net, device_id));
        }
    }

    impl Probes {
        fn take(&self) -> Vec<(u16, u32)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn addr(net: u16, last: u8) -> BacnetAddress {
        BacnetAddress::new(net, &[10, 0, 0, last, 0xBA, 0xC0]).unwrap()
    }

    fn cache(config: BindingConfig) -> (AddressBindingCache, Arc<ManualClock>, Arc<Probes>) {
        let clock = Arc::new(ManualClock::new());
        let probes = Arc::new(Probes::default());
        let cache = AddressBindingCache::new(config, 1, clock.clone());
        cache.set_who_is_sender(probes.clone());
        (cache, clock, probes)
    }

    #[test]
    fn test_config_sanitized() {
        let config = BindingConfig {
            ttl: 5,
            max_entries: 1,
            max_whois_entries: 2,
        }
        .sanitized();
        assert_eq!(config.ttl, 20);
        assert_eq!(config.max_entries, 64);
        assert_eq!(config.max_whois_entries, 64);
        assert_eq!(BindingConfig::default().sanitized(), BindingConfig::default());
    }

    #[test]
    fn test_add_and_query() {
        let (cache, _clock, probes) = cache(BindingConfig::default());
        cache.add(100, 100_000, &addr(0, 1), false).unwrap();
        assert_eq!(cache.query_address_from_device(100), Some((addr(0, 1), 65535)));
        assert_eq!(cache.query_device_from_address(&addr(0, 1)), Some((100, 65535)));
        assert!(probes.take().is_empty());

        assert_eq!(cache.add(BACNET_MAX_INSTANCE, 50, &addr(0, 2), false), Err(BindingError::InvalidDevice(BACNET_MAX_INSTANCE)));
        assert_eq!(cache.query_address_from_device(1), None);
        assert!(probes.take().is_empty());
    }

    #[test]
    fn test_miss_probes_with_throttle() {
        let (cache, clock, probes) = cache(BindingConfig::default());
        assert_eq!(cache.query_address_from_device(7), None);
        assert_eq!(probes.take(), vec![(0xFFFF, 7)]);

        // within the minimum interval
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.query_address_from_device(7), None);
        assert!(probes.take().is_empty());

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.query_address_from_device(7), None);
        assert_eq!(probes.take(), vec![(0xFFFF, 7)]);

        // interval doubled to 20 s
        clock.advance(Duration::from_secs(15));
        cache.query_address_from_device(7);
        assert!(probes.take().is_empty());
        clock.advance(Duration::from_secs(5));
        cache.query_address_from_device(7);
        assert_eq!(probes.take(), vec![(0xFFFF, 7)]);

        // learning the binding clears the throttle
        cache.add(7, 480, &addr(3, 7), false).unwrap();
        cache.delete(7).unwrap();
        cache.query_address_from_device(7);
        assert_eq!(probes.take(), vec![(0xFFFF, 7)]);
    }

    #[test]
    fn test_ttl_refresh_and_expiry() {
        let (cache, clock, probes) = cache(BindingConfig::default());
        cache.add(9, 1476, &addr(4, 9), false).unwrap();

        clock.advance(Duration::from_secs(151));
        assert_eq!(cache.query_address_from_device(9), Some((addr(4, 9), 1476)));
        assert_eq!(probes.take(), vec![(4, 9)]);

        clock.advance(Duration::from_secs(149));
        assert_eq!(cache.query_address_from_device(9), None);
        assert_eq!(probes.take(), vec![(0xFFFF, 9)]);
        assert_eq!(cache.len(), (0, 0));
    }

    #[test]
    fn test_static_entries_pinned() {
        let (cache, clock, _probes) = cache(BindingConfig::default());
        cache.add(5, 1476, &addr(0, 5), true).unwrap();

        assert_eq!(cache.add(5, 1476, &addr(0, 6), false), Err(BindingError::StaticDevice(5)));
        assert_eq!(cache.add(6, 1476, &addr(0, 5), false), Err(BindingError::StaticAddress(addr(0, 5))));

        clock.advance(Duration::from_secs(10_000));
        assert_eq!(cache.query_address_from_device(5), Some((addr(0, 5), 1476)));
        assert_eq!(cache.query_device_from_address(&addr(0, 5)), Some((5, 1476)));
    }

    #[test]
    fn test_rebinding() {
        let (cache, _clock, _probes) = cache(BindingConfig::default());
        cache.add(10, 480, &addr(0, 10), false).unwrap();

        // another device claims the address
        cache.add(11, 480, &addr(0, 10), false).unwrap();
        assert_eq!(cache.query_device_from_address(&addr(0, 10)), Some((11, 480)));
        assert_eq!(cache.len(), (0, 1));

        // the device moves
        cache.add(11, 1024, &addr(0, 12), false).unwrap();
        assert_eq!(cache.query_device_from_address(&addr(0, 10)), None);
        assert_eq!(cache.query_device_from_address(&addr(0, 12)), Some((11, 1024)));
    }

    #[test]
    fn test_lru_eviction_keeps_statics() {
        let (cache, _clock, _probes) = cache(BindingConfig {
            max_entries: 64,
            ..BindingConfig::default()
        });
        cache.add(1000, 1476, &addr(9, 200), true).unwrap();
        for device in 0..64u32 {
            cache.add(device + 2, 1476, &addr(1, device as u8), false).unwrap();
        }
        // device 2 is the oldest; touching it makes device 3 the victim
        assert!(cache.query_address_from_device(2).is_some());
        cache.add(500, 1476, &addr(2, 1), false).unwrap();

        // a static hit does not take a dynamic slot
        assert!(cache.query_address_from_device(1000).is_some());
        assert_eq!(cache.len(), (1, 64));
        assert!(cache.query_device_from_address(&addr(1, 0)).is_some());
        assert!(cache.query_device_from_address(&addr(1, 1)).is_none());
        assert!(cache.query_device_from_address(&addr(9, 200)).is_some());
    }

    #[test]
    fn test_get_by_net() {
        let (cache, clock, _probes) = cache(BindingConfig::default());
        cache.add(20, 1476, &addr(1, 20), true).unwrap();
        cache.add(21, 1476, &addr(1, 21), false).unwrap();
        cache.add(22, 1476, &addr(2, 22), false).unwrap();

        assert_eq!(cache.get_by_net(1, 10), vec![(addr(1, 20), 1476), (addr(1, 21), 1476)]);
        assert_eq!(cache.get_by_net(0xFFFF, 10).len(), 3);
        assert_eq!(cache.get_by_net(0xFFFF, 1).len(), 1);

        clock.advance(Duration::from_secs(300));
        assert_eq!(cache.get_by_net(0xFFFF, 10), vec![(addr(1, 20), 1476)]);
        assert_eq!(cache.len(), (1, 0));
    }

    #[test]
    fn test_encode_address_binding() {
        let (cache, _clock, _probes) = cache(BindingConfig::default());
        let local = BacnetAddress::local(&[1]).unwrap();
        cache.add(3, 50, &local, false).unwrap();

        let mut out = Vec::new();
        cache.encode_address_binding(&mut out, 100).unwrap();
        assert_eq!(out, vec![0xC4, 0x02, 0x00, 0x00, 0x03, 0x21, 0x00, 0x61, 0x01]);

        let mut small = Vec::new();
        assert_eq!(
            cache.encode_address_binding(&mut small, 4),
            Err(BindingError::TooLarge { needed: 9, available: 4 })
        );
        assert!(small.is_empty());
    }

    #[test]
    fn test_destroy() {
        let (cache, _clock, _probes) = cache(BindingConfig::default());
        cache.add(30, 1476, &addr(0, 30), true).unwrap();
        cache.add(31, 1476, &addr(0, 31), false).unwrap();
        cache.destroy();
        assert!(cache.is_empty());
        assert_eq!(cache.delete(31), Err(BindingError::NotFound(31)));
    }
}

//! APDU dispatcher and the send paths of one stack instance.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use log::{debug, error, log_enabled, trace, warn, Level};

use super::dcc::{CommunicationControl, CommunicationState};
use super::{
    encode_abort_apdu, encode_confirmed_service_request, encode_reject_apdu, encode_unconfirmed_request, Apdu,
    ApduError, ConfirmedRequest, DeviceConfig, Result, StackConfig,
};
use crate::binding::{AddressBindingCache, WhoIsSender};
use crate::buffer::BacnetBuf;
use crate::network::{BacnetAddress, NetworkLayer, NetworkPriority};
use crate::object::{ObjectDatabase, PropertyReference, ProtocolServicesSupported};
use crate::service::discovery::{IAmRequest, IHaveRequest, WhoIsRequest};
use crate::service::property::ReadPropertyRequest;
use crate::service::{
    device, discovery, property, AbortReason, ConfirmedServiceChoice, ConfirmedServiceHandler, RejectReason,
    ServiceTable, UnconfirmedServiceChoice, UnconfirmedServiceHandler,
};
use crate::tsm::{Invoker, InvokerEvent, InvokerHandler, Tsm};
use crate::util::{hex_dump, read, write, Clock};
use crate::{BACNET_BROADCAST_NETWORK, BACNET_MAX_APDU};

/// Confirmed services a peer may still use while communication is disabled.
const DCC_EXEMPT: [u8; 2] = [
    ConfirmedServiceChoice::DeviceCommunicationControl as u8,
    ConfirmedServiceChoice::ReinitializeDevice as u8,
];

/// Counters kept by the dispatcher. Read them with [`Ordering::Relaxed`].
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// APDUs handed to [`ApplicationLayer::handle_apdu`]
    pub received: AtomicU64,
    /// APDUs accepted by the network layer
    pub sent: AtomicU64,
    pub confirmed_requests: AtomicU64,
    pub unconfirmed_requests: AtomicU64,
    /// Acks, errors, rejects and aborts passed to the TSM
    pub replies: AtomicU64,
    /// Replies the TSM had no transaction for
    pub unmatched_replies: AtomicU64,
    /// Malformed or DCC-suppressed APDUs
    pub dropped: AtomicU64,
    pub rejects_sent: AtomicU64,
    pub aborts_sent: AtomicU64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outbound half of the stack: DCC gating in front of the network layer.
///
/// The TSM and the address binding cache send through this rather than
/// through [`ApplicationLayer`], so neither holds a reference back to the
/// layer that owns them.
pub struct Transmitter {
    network: Arc<dyn NetworkLayer>,
    dcc: Arc<CommunicationControl>,
    stats: Arc<DispatchStats>,
}

impl Transmitter {
    pub fn new(network: Arc<dyn NetworkLayer>, dcc: Arc<CommunicationControl>, stats: Arc<DispatchStats>) -> Self {
        Self { network, dcc, stats }
    }

    /// Sends `apdu` if communication is enabled.
    ///
    /// A request expecting a reply may not go to a broadcast address.
    pub fn send(&self, dst: &BacnetAddress, apdu: &mut BacnetBuf, priority: NetworkPriority, der: bool) -> Result<()> {
        let state = self.dcc.state();
        if state != CommunicationState::Enable {
            debug!("not sending {} bytes to {}: communication {:?}", apdu.len(), dst, state);
            return Err(ApduError::CommunicationDisabled(state));
        }
        self.send_ungated(dst, apdu, priority, der)
    }

    fn send_ungated(&self, dst: &BacnetAddress, apdu: &mut BacnetBuf, priority: NetworkPriority, der: bool) -> Result<()> {
        if der && dst.is_broadcast() {
            return Err(ApduError::BroadcastConfirmed(*dst));
        }
        trace!("sending {} bytes to {} (der: {})", apdu.len(), dst, der);
        self.network.send_pdu(dst, apdu, priority, der)?;
        DispatchStats::bump(&self.stats.sent);
        Ok(())
    }
}

impl crate::tsm::ApduTransmit for Transmitter {
    fn transmit(&self, dst: &BacnetAddress, apdu: &mut BacnetBuf, priority: NetworkPriority) -> Result<()> {
        self.send(dst, apdu, priority, true)
    }
}

impl WhoIsSender for Transmitter {
    fn send_who_is(&self, net: u16, device_id: u32) {
        let dst = if net == BACNET_BROADCAST_NETWORK {
            BacnetAddress::global_broadcast()
        } else {
            BacnetAddress::remote_broadcast(net)
        };
        let mut apdu = BacnetBuf::new(BACNET_MAX_APDU);
        let sent = encode_who_is(&mut apdu, &WhoIsRequest::for_device(device_id))
            .and_then(|_| self.send(&dst, &mut apdu, NetworkPriority::Normal, false));
        if let Err(e) = sent {
            debug!("Who-Is for device {} on network {} not sent: {}", device_id, net, e);
        }
    }
}

impl fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmitter").field("dcc", &self.dcc).finish_non_exhaustive()
    }
}

fn encode_who_is(apdu: &mut BacnetBuf, request: &WhoIsRequest) -> Result<()> {
    let mut body = Vec::new();
    request.encode(&mut body)?;
    encode_unconfirmed_request(apdu, UnconfirmedServiceChoice::WhoIs as u8)?;
    apdu.put_slice(&body)?;
    Ok(())
}

/// One BACnet stack instance: service dispatch, the TSM, the address binding
/// cache and DeviceCommunicationControl state.
///
/// Every method takes `&self`; the layer is meant to be shared behind an
/// [`Arc`] between the receive path, the timer driver and application
/// threads.
pub struct ApplicationLayer {
    device: DeviceConfig,
    database: Arc<dyn ObjectDatabase>,
    dcc: Arc<CommunicationControl>,
    transmitter: Arc<Transmitter>,
    binding: Arc<AddressBindingCache>,
    tsm: Arc<Tsm>,
    services: RwLock<ServiceTable>,
    stats: Arc<DispatchStats>,
}

impl ApplicationLayer {
    /// Builds the stack and installs the default handlers for the configured
    /// role.
    pub fn new(
        config: StackConfig,
        network: Arc<dyn NetworkLayer>,
        database: Arc<dyn ObjectDatabase>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let StackConfig {
            tsm,
            binding,
            device,
        } = config;

        let stats = Arc::new(DispatchStats::default());
        let dcc = Arc::new(CommunicationControl::new(clock.clone()));
        let transmitter = Arc::new(Transmitter::new(network, dcc.clone(), stats.clone()));

        let binding = Arc::new(AddressBindingCache::new(binding, device.device_instance, clock.clone()));
        binding.set_who_is_sender(transmitter.clone());
        binding.add_static(&device.static_bindings);

        let tsm = Arc::new(Tsm::new(tsm, clock, transmitter.clone()));

        let app = Self {
            device,
            database,
            dcc,
            transmitter,
            binding,
            tsm,
            services: RwLock::new(ServiceTable::new()),
            stats,
        };
        app.install_default_handlers();
        app
    }

    /// Dispatches one received APDU from `src`.
    ///
    /// Any immediate answer (acknowledgement, Error, Reject or Abort) is left
    /// in `reply` for the caller to send back to `src`; `reply` is empty when
    /// there is nothing to answer.
    pub fn handle_apdu(&self, apdu: &[u8], src: &BacnetAddress, reply: &mut BacnetBuf) {
        DispatchStats::bump(&self.stats.received);
        if log_enabled!(Level::Trace) {
            trace!("APDU from {}:\n{}", src, hex_dump(apdu, "  "));
        }
        if reply.init(BACNET_MAX_APDU).is_err() {
            // smaller buffers keep their own window
            reply.clear();
        }

        let decoded = match Apdu::decode(apdu) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("dropping APDU from {}: {}", src, e);
                DispatchStats::bump(&self.stats.dropped);
                return;
            }
        };

        match decoded {
            Apdu::ConfirmedRequest(request) => self.handle_confirmed(&request, src, reply),
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => self.handle_unconfirmed(service_choice, service_data, src),
            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => self.deliver(src, invoke_id, Some(service_choice), InvokerEvent::SimpleAck),
            Apdu::ComplexAck {
                segmented: true,
                invoke_id,
                ..
            } => {
                warn!("segmented ComplexACK {} from {} aborted", invoke_id, src);
                self.abort(reply, invoke_id, false);
            }
            Apdu::ComplexAck {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => self.deliver(
                src,
                invoke_id,
                Some(service_choice),
                InvokerEvent::ComplexAck { service_data },
            ),
            Apdu::SegmentAck {
                server, invoke_id, ..
            } => {
                warn!("SegmentACK {} from {} aborted", invoke_id, src);
                self.abort(reply, invoke_id, !server);
            }
            Apdu::Error {
                invoke_id,
                service_choice,
                class,
                code,
            } => self.deliver(src, invoke_id, Some(service_choice), InvokerEvent::Error { class, code }),
            Apdu::Reject { invoke_id, reason } => self.deliver(src, invoke_id, None, InvokerEvent::Reject { reason }),
            Apdu::Abort {
                server,
                invoke_id,
                reason,
            } => self.deliver(src, invoke_id, None, InvokerEvent::Abort { reason, server }),
        }
    }

    fn handle_confirmed(&self, request: &ConfirmedRequest<'_>, src: &BacnetAddress, reply: &mut BacnetBuf) {
        DispatchStats::bump(&self.stats.confirmed_requests);
        let choice = request.service_choice;

        if self.dcc.communication_disabled() && !DCC_EXEMPT.contains(&choice) {
            debug!("communication disabled, ignoring service {} from {}", choice, src);
            DispatchStats::bump(&self.stats.dropped);
            return;
        }

        if request.segmented {
            warn!("segmented request {} from {} aborted", request.invoke_id, src);
            self.abort(reply, request.invoke_id, true);
            return;
        }

        let handler = ConfirmedServiceChoice::try_from(choice)
            .ok()
            .and_then(|choice| read(&self.services).confirmed(choice));
        let Some(handler) = handler else {
            debug!("no handler for confirmed service {} from {}", choice, src);
            if let Err(e) = encode_reject_apdu(reply, request.invoke_id, RejectReason::UnrecognizedService) {
                error!("cannot encode Reject for {}: {}", src, e);
                reply.clear();
                return;
            }
            DispatchStats::bump(&self.stats.rejects_sent);
            return;
        };

        if request.max_apdu < reply.capacity() {
            if let Err(e) = reply.resize(request.max_apdu) {
                error!("cannot bound reply to {} bytes: {}", request.max_apdu, e);
            }
        }

        trace!("confirmed service {} invoke {} from {}", choice, request.invoke_id, src);
        if let Err(failure) = handler.handle(self, request, src, reply) {
            debug!("service {} from {} failed: {}", choice, src, failure);
            if let Err(e) = failure.encode_reply(reply, request.invoke_id, choice) {
                error!("cannot encode {} for {}: {}", failure, src, e);
                reply.clear();
            }
        }
    }

    fn handle_unconfirmed(&self, choice: u8, service_data: &[u8], src: &BacnetAddress) {
        DispatchStats::bump(&self.stats.unconfirmed_requests);

        match self.dcc.state() {
            CommunicationState::Disable => {
                debug!("communication disabled, ignoring unconfirmed service {} from {}", choice, src);
                DispatchStats::bump(&self.stats.dropped);
                return;
            }
            CommunicationState::DisableInitiation if choice != UnconfirmedServiceChoice::WhoIs as u8 => {
                debug!("initiation disabled, ignoring unconfirmed service {} from {}", choice, src);
                DispatchStats::bump(&self.stats.dropped);
                return;
            }
            _ => {}
        }

        let handler = UnconfirmedServiceChoice::try_from(choice)
            .ok()
            .and_then(|choice| read(&self.services).unconfirmed(choice));
        match handler {
            Some(handler) => handler.handle(self, service_data, src),
            None => warn!("no handler for unconfirmed service {} from {}", choice, src),
        }
    }

    fn deliver(&self, src: &BacnetAddress, invoke_id: u8, service_choice: Option<u8>, event: InvokerEvent<'_>) {
        DispatchStats::bump(&self.stats.replies);
        if !self.tsm.on_response(src, invoke_id, service_choice, event) {
            DispatchStats::bump(&self.stats.unmatched_replies);
        }
    }

    fn abort(&self, reply: &mut BacnetBuf, invoke_id: u8, server: bool) {
        reply.clear();
        match encode_abort_apdu(reply, invoke_id, AbortReason::SegmentationNotSupported, server) {
            Ok(()) => DispatchStats::bump(&self.stats.aborts_sent),
            Err(e) => {
                error!("cannot encode Abort {}: {}", invoke_id, e);
                reply.clear();
            }
        }
    }

    /// Sends a complete APDU to `dst`, subject to DeviceCommunicationControl.
    pub fn send(&self, dst: &BacnetAddress, apdu: &mut BacnetBuf, priority: NetworkPriority, der: bool) -> Result<()> {
        self.transmitter.send(dst, apdu, priority, der)
    }

    /// Sends `apdu` to the address bound to `device_id`.
    ///
    /// A missing binding fails with [`ApduError::UnknownDevice`] after the
    /// cache has started a Who-Is probe for it.
    pub fn send_to_device(
        &self,
        device_id: u32,
        apdu: &mut BacnetBuf,
        priority: NetworkPriority,
        der: bool,
    ) -> Result<()> {
        let dst = self.bound_address(device_id, apdu.len())?;
        self.send(&dst, apdu, priority, der)
    }

    fn bound_address(&self, device_id: u32, len: usize) -> Result<BacnetAddress> {
        let (dst, max_apdu) = self
            .binding
            .query_address_from_device(device_id)
            .ok_or(ApduError::UnknownDevice(device_id))?;
        if len > max_apdu as usize {
            return Err(ApduError::TooLong {
                device: device_id,
                len,
                max_apdu,
            });
        }
        Ok(dst)
    }

    /// Transmits `apdu` for an allocated invoker and arms its reply timer.
    pub fn send_confirmed(
        &self,
        invoker: &Invoker,
        apdu: &mut BacnetBuf,
        priority: NetworkPriority,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.tsm.send_apdu(invoker, apdu, priority, timeout)?;
        Ok(())
    }

    /// Starts a confirmed `service` request to `device_id`.
    ///
    /// Resolves the device, allocates an invoke ID and sends the request with
    /// the default timeout. The invoker is released again if nothing could be
    /// sent. The caller frees it once `handler` has seen the outcome.
    pub fn request<H>(
        &self,
        device_id: u32,
        service: ConfirmedServiceChoice,
        service_data: &[u8],
        handler: H,
    ) -> Result<Invoker>
    where
        H: InvokerHandler + 'static,
    {
        let len = 4 + service_data.len();
        let dst = self.bound_address(device_id, len)?;
        let invoker = self.tsm.alloc_invoke_id(&dst, service, handler)?;

        let mut apdu = BacnetBuf::new(BACNET_MAX_APDU);
        let sent = encode_confirmed_service_request(&mut apdu, invoker.invoke_id().0, service as u8)
            .and_then(|_| apdu.put_slice(service_data))
            .map_err(ApduError::from)
            .and_then(|_| self.send_confirmed(&invoker, &mut apdu, NetworkPriority::Normal, None));

        if let Err(e) = sent {
            if let Err(free) = self.tsm.free_invoke_id(&invoker) {
                warn!("cannot release invoker {}: {}", invoker.invoke_id(), free);
            }
            return Err(e);
        }
        Ok(invoker)
    }

    /// ReadProperty of `reference` on `device_id`.
    pub fn read_property<H>(&self, device_id: u32, reference: &PropertyReference, handler: H) -> Result<Invoker>
    where
        H: InvokerHandler + 'static,
    {
        let mut body = Vec::new();
        ReadPropertyRequest { reference: *reference }.encode(&mut body)?;
        self.request(device_id, ConfirmedServiceChoice::ReadProperty, &body, handler)
    }

    /// Broadcasts a Who-Is to `dst`.
    pub fn send_who_is(&self, dst: &BacnetAddress, request: &WhoIsRequest) -> Result<()> {
        let mut apdu = BacnetBuf::new(BACNET_MAX_APDU);
        encode_who_is(&mut apdu, request)?;
        self.send(dst, &mut apdu, NetworkPriority::Normal, false)
    }

    /// Announces this device to `dst`.
    ///
    /// This is the one initiation still allowed under DisableInitiation, so
    /// that the device keeps answering Who-Is; it fails only when
    /// communication is disabled entirely.
    pub fn send_i_am(&self, dst: &BacnetAddress) -> Result<()> {
        if self.dcc.communication_disabled() {
            return Err(ApduError::CommunicationDisabled(CommunicationState::Disable));
        }
        let i_am = IAmRequest::new(
            self.device.device_instance,
            BACNET_MAX_APDU as u32,
            self.device.vendor_identifier,
        );
        let mut body = Vec::new();
        i_am.encode(&mut body)?;

        let mut apdu = BacnetBuf::new(BACNET_MAX_APDU);
        encode_unconfirmed_request(&mut apdu, UnconfirmedServiceChoice::IAm as u8)?;
        apdu.put_slice(&body)?;
        self.transmitter
            .send_ungated(dst, &mut apdu, NetworkPriority::Normal, false)
    }

    /// Broadcasts an I-Have on every network.
    pub fn send_i_have(&self, i_have: &IHaveRequest) -> Result<()> {
        let mut body = Vec::new();
        i_have.encode(&mut body)?;

        let mut apdu = BacnetBuf::new(BACNET_MAX_APDU);
        encode_unconfirmed_request(&mut apdu, UnconfirmedServiceChoice::IHave as u8)?;
        apdu.put_slice(&body)?;
        self.send(&BacnetAddress::global_broadcast(), &mut apdu, NetworkPriority::Normal, false)
    }

    /// Installs `handler` for `choice`, or removes it for `None`.
    pub fn set_confirmed_handler(
        &self,
        choice: ConfirmedServiceChoice,
        handler: Option<Arc<dyn ConfirmedServiceHandler>>,
    ) {
        write(&self.services).set_confirmed(choice, handler);
    }

    pub fn set_unconfirmed_handler(
        &self,
        choice: UnconfirmedServiceChoice,
        handler: Option<Arc<dyn UnconfirmedServiceHandler>>,
    ) {
        write(&self.services).set_unconfirmed(choice, handler);
    }

    /// Replaces the dispatch tables with the standard handlers.
    ///
    /// A server answers the property, device management and discovery
    /// services. A client only listens for I-Am and I-Have.
    pub fn install_default_handlers(&self) {
        use ConfirmedServiceChoice as C;
        use UnconfirmedServiceChoice as U;

        let mut table = ServiceTable::new();
        table.set_unconfirmed(U::IAm, Some(Arc::new(discovery::handle_i_am)));
        table.set_unconfirmed(U::IHave, Some(Arc::new(discovery::handle_i_have)));

        if !self.device.is_client {
            table.set_confirmed(C::ReadProperty, Some(Arc::new(property::handle_read_property)));
            table.set_confirmed(C::WriteProperty, Some(Arc::new(property::handle_write_property)));
            table.set_confirmed(C::ReadPropertyMultiple, Some(Arc::new(property::handle_read_property_multiple)));
            table.set_confirmed(C::WritePropertyMultiple, Some(Arc::new(property::handle_write_property_multiple)));
            table.set_confirmed(C::ReadRange, Some(Arc::new(property::handle_read_range)));
            table.set_confirmed(C::ReinitializeDevice, Some(Arc::new(device::handle_reinitialize_device)));
            table.set_confirmed(
                C::DeviceCommunicationControl,
                Some(Arc::new(device::handle_device_communication_control)),
            );

            table.set_unconfirmed(U::WhoIs, Some(Arc::new(discovery::handle_who_is)));
            table.set_unconfirmed(U::WhoHas, Some(Arc::new(discovery::handle_who_has)));
            table.set_unconfirmed(U::TimeSynchronization, Some(Arc::new(device::handle_time_synchronization)));
            table.set_unconfirmed(
                U::UtcTimeSynchronization,
                Some(Arc::new(device::handle_utc_time_synchronization)),
            );
            table.set_unconfirmed(
                U::UnconfirmedCovNotification,
                Some(Arc::new(device::handle_unconfirmed_cov_notification)),
            );
        }

        *write(&self.services) = table;
    }

    /// Protocol_Services_Supported for the installed handlers.
    pub fn services_supported(&self) -> ProtocolServicesSupported {
        read(&self.services).services_supported()
    }

    pub fn device_instance(&self) -> u32 {
        self.device.device_instance
    }

    pub fn is_client(&self) -> bool {
        self.device.is_client
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn database(&self) -> &dyn ObjectDatabase {
        self.database.as_ref()
    }

    pub fn binding(&self) -> &AddressBindingCache {
        &self.binding
    }

    pub fn tsm(&self) -> &Arc<Tsm> {
        &self.tsm
    }

    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    pub fn communication_control(&self) -> &CommunicationControl {
        &self.dcc
    }

    /// Enters `state` for `minutes` (0 for indefinitely).
    pub fn set_communication_control(&self, state: CommunicationState, minutes: u16) {
        self.dcc.set(state, minutes);
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

impl fmt::Debug for ApplicationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationLayer")
            .field("device", &self.device.device_instance)
            .field("dcc", &self.dcc)
            .field("tsm", &self.tsm)
            .field("services", &*read(&self.services))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::app::{encode_complex_ack_header, encode_error_apdu, encode_simple_ack};
    use crate::encoding::encode_character_string;
    use crate::network::testing::RecordingNetwork;
    use crate::object::database::MemoryDatabase;
    use crate::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};
    use crate::service::device::DeviceCommunicationControlRequest;
    use crate::service::discovery::{WhoHasObject, WhoHasRequest};
    use crate::service::property::{encode_read_property_apdu, ReadPropertyAck};
    use crate::service::{ErrorClass, ErrorCode, ServiceFailure};
    use crate::tsm::testing::EventLog;
    use crate::util::ManualClock;

    const DEVICE: u32 = 4001;
    const PEER_DEVICE: u32 = 1234;

    struct Fixture {
        clock: Arc<ManualClock>,
        network: Arc<RecordingNetwork>,
        app: ApplicationLayer,
    }

    fn fixture_with(is_client: bool) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Arc::new(ManualClock::new());
        let network = Arc::new(RecordingNetwork::default());
        let mut config = StackConfig::default();
        config.device.device_instance = DEVICE;
        config.device.is_client = is_client;
        let database = Arc::new(MemoryDatabase::new(DEVICE, "plant-room"));
        let app = ApplicationLayer::new(config, network.clone(), database, clock.clone());
        Fixture { clock, network, app }
    }

    fn fixture() -> Fixture {
        fixture_with(false)
    }

    fn peer() -> BacnetAddress {
        BacnetAddress::local(&[192, 168, 1, 20, 0xBA, 0xC0]).unwrap()
    }

    fn dispatch(app: &ApplicationLayer, apdu: &[u8]) -> Vec<u8> {
        let mut reply = BacnetBuf::new(BACNET_MAX_APDU);
        app.handle_apdu(apdu, &peer(), &mut reply);
        reply.data().to_vec()
    }

    fn read_property(invoke_id: u8, object: ObjectIdentifier, property: PropertyIdentifier) -> Vec<u8> {
        let mut buf = BacnetBuf::new(BACNET_MAX_APDU);
        encode_read_property_apdu(&mut buf, invoke_id, &PropertyReference::new(object, property)).unwrap();
        buf.data().to_vec()
    }

    fn i_am(device: u32, max_apdu: u32) -> Vec<u8> {
        let mut apdu = vec![0x10, 0x00];
        IAmRequest::new(device, max_apdu, 260).encode(&mut apdu).unwrap();
        apdu
    }

    fn bind_peer(f: &Fixture) {
        assert!(dispatch(&f.app, &i_am(PEER_DEVICE, 480)).is_empty());
    }

    #[test]
    fn test_read_property_answered() {
        let f = fixture();
        let device = ObjectIdentifier::new(ObjectType::Device, DEVICE);
        let reply = dispatch(&f.app, &read_property(9, device, PropertyIdentifier::ObjectName));

        match Apdu::decode(&reply).unwrap() {
            Apdu::ComplexAck {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => {
                assert_eq!(invoke_id, 9);
                assert_eq!(service_choice, ConfirmedServiceChoice::ReadProperty as u8);
                let ack = ReadPropertyAck::decode(service_data).unwrap();
                assert_eq!(ack.reference.object, device);
                let mut name = Vec::new();
                encode_character_string(&mut name, "plant-room").unwrap();
                assert_eq!(ack.value, name);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(f.app.stats().confirmed_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_handler_failure_becomes_error_pdu() {
        let f = fixture();
        let missing = ObjectIdentifier::new(ObjectType::AnalogInput, 99);
        let reply = dispatch(&f.app, &read_property(4, missing, PropertyIdentifier::PresentValue));
        assert_eq!(
            Apdu::decode(&reply).unwrap(),
            Apdu::Error {
                invoke_id: 4,
                service_choice: 12,
                class: Some(ErrorClass::Object),
                code: Some(ErrorCode::UnknownObject),
            }
        );
    }

    #[test]
    fn test_unregistered_service_rejected() {
        let f = fixture();
        let reply = dispatch(&f.app, &[0x00, 0x05, 21, ConfirmedServiceChoice::AtomicReadFile as u8, 0x00]);
        assert_eq!(reply, vec![0x60, 21, 9]);
        assert_eq!(f.app.stats().rejects_sent.load(Ordering::Relaxed), 1);

        // choices beyond the known range as well
        let reply = dispatch(&f.app, &[0x00, 0x05, 22, 99]);
        assert_eq!(reply, vec![0x60, 22, 9]);
    }

    #[test]
    fn test_client_role_serves_nothing() {
        let f = fixture_with(true);
        let device = ObjectIdentifier::new(ObjectType::Device, DEVICE);
        let reply = dispatch(&f.app, &read_property(1, device, PropertyIdentifier::ObjectName));
        assert_eq!(reply, vec![0x60, 1, 9]);

        assert!(dispatch(&f.app, &[0x10, 0x08]).is_empty());
        assert!(f.network.frames().is_empty());

        let supported = f.app.services_supported();
        assert!(supported.contains(ProtocolServicesSupported::from_unconfirmed(UnconfirmedServiceChoice::IAm)));
        assert!(!supported.contains(ProtocolServicesSupported::from_confirmed(ConfirmedServiceChoice::ReadProperty)));
    }

    #[test]
    fn test_segmented_request_aborted() {
        let f = fixture();
        // segmented, seq 0, window 1
        let reply = dispatch(&f.app, &[0x08, 0x05, 3, 0, 1, 12, 0x0C]);
        assert_eq!(reply, vec![0x71, 3, 4]);
        assert_eq!(f.app.stats().aborts_sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_segmented_complex_ack_aborted_as_client() {
        let f = fixture();
        let reply = dispatch(&f.app, &[0x38, 17, 0, 1, 12, 0x0C]);
        assert_eq!(reply, vec![0x70, 17, 4]);
    }

    #[test]
    fn test_segment_ack_aborted_with_opposite_role() {
        let f = fixture();
        assert_eq!(dispatch(&f.app, &[0x40, 5, 0, 1]), vec![0x71, 5, 4]);
        assert_eq!(dispatch(&f.app, &[0x41, 5, 0, 1]), vec![0x70, 5, 4]);
    }

    #[test]
    fn test_malformed_apdus_dropped() {
        let f = fixture();
        assert!(dispatch(&f.app, &[]).is_empty());
        assert!(dispatch(&f.app, &[0x00, 0x05]).is_empty());
        assert!(dispatch(&f.app, &[0x10]).is_empty());
        assert!(dispatch(&f.app, &[0x60, 1]).is_empty());
        assert!(dispatch(&f.app, &[0x90, 1, 2]).is_empty());
        assert_eq!(f.app.stats().dropped.load(Ordering::Relaxed), 5);
        assert_eq!(f.app.stats().received.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_reply_bounded_by_requester() {
        let f = fixture();
        let seen = Arc::new(AtomicUsize::new(0));
        let capacity = seen.clone();
        let handler: Arc<dyn ConfirmedServiceHandler> = Arc::new(
            move |_: &ApplicationLayer,
                  request: &ConfirmedRequest<'_>,
                  _: &BacnetAddress,
                  reply: &mut BacnetBuf|
                  -> std::result::Result<(), ServiceFailure> {
                capacity.store(reply.capacity(), Ordering::SeqCst);
                encode_simple_ack(reply, request.invoke_id, request.service_choice)?;
                Ok(())
            },
        );
        f.app
            .set_confirmed_handler(ConfirmedServiceChoice::AtomicReadFile, Some(handler));

        // max-resp code 0 is 50 octets
        let reply = dispatch(&f.app, &[0x00, 0x00, 8, 6]);
        assert_eq!(reply, vec![0x20, 8, 6]);
        assert_eq!(seen.load(Ordering::SeqCst), 50);

        let reply = dispatch(&f.app, &[0x00, 0x05, 9, 6]);
        assert_eq!(reply, vec![0x20, 9, 6]);
        assert_eq!(seen.load(Ordering::SeqCst), BACNET_MAX_APDU);

        f.app
            .set_confirmed_handler(ConfirmedServiceChoice::AtomicReadFile, None);
        assert_eq!(dispatch(&f.app, &[0x00, 0x05, 10, 6]), vec![0x60, 10, 9]);
    }

    #[test]
    fn test_oversized_ack_aborts() {
        let f = fixture();
        let handler: Arc<dyn ConfirmedServiceHandler> = Arc::new(
            |_: &ApplicationLayer,
             request: &ConfirmedRequest<'_>,
             _: &BacnetAddress,
             reply: &mut BacnetBuf|
             -> std::result::Result<(), ServiceFailure> {
                encode_complex_ack_header(reply, request.invoke_id, request.service_choice)?;
                reply.put_slice(&[0u8; 60])?;
                Ok(())
            },
        );
        f.app
            .set_confirmed_handler(ConfirmedServiceChoice::AtomicReadFile, Some(handler));
        assert_eq!(dispatch(&f.app, &[0x00, 0x00, 2, 6]), vec![0x71, 2, 4]);
    }

    #[test]
    fn test_who_is_answered_with_i_am() {
        let f = fixture();
        assert!(dispatch(&f.app, &[0x10, 0x08]).is_empty());

        let frames = f.network.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dst, BacnetAddress::remote_broadcast(0));
        assert!(!frames[0].der);
        let expected = i_am(DEVICE, BACNET_MAX_APDU as u32);
        assert_eq!(&frames[0].apdu[..], &expected[..]);

        // a Who-Is for some other device is ignored
        let mut other = vec![0x10, 0x08];
        WhoIsRequest::for_device(DEVICE + 1).encode(&mut other).unwrap();
        dispatch(&f.app, &other);
        assert!(f.network.frames().is_empty());
    }

    #[test]
    fn test_i_am_populates_binding() {
        let f = fixture();
        bind_peer(&f);
        assert_eq!(
            f.app.binding().query_address_from_device(PEER_DEVICE),
            Some((peer(), 480))
        );
        assert!(f.network.frames().is_empty());
    }

    #[test]
    fn test_send_to_device() {
        let f = fixture();
        let mut apdu = BacnetBuf::from_slice(&[0x10, 0x08]);

        match f.app.send_to_device(PEER_DEVICE, &mut apdu, NetworkPriority::Normal, false) {
            Err(ApduError::UnknownDevice(PEER_DEVICE)) => {}
            other => panic!("unexpected {:?}", other),
        }
        // the lookup went looking for the device
        let probes = f.network.take();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].dst, BacnetAddress::global_broadcast());
        assert_eq!(&probes[0].apdu[..2], &[0x10, 0x08]);

        bind_peer(&f);
        f.app
            .send_to_device(PEER_DEVICE, &mut apdu, NetworkPriority::Urgent, false)
            .unwrap();
        let frames = f.network.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dst, peer());
        assert_eq!(frames[0].priority, NetworkPriority::Urgent);

        let mut long = BacnetBuf::from_slice(&[0u8; 481]);
        match f.app.send_to_device(PEER_DEVICE, &mut long, NetworkPriority::Normal, false) {
            Err(ApduError::TooLong { len: 481, max_apdu: 480, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_confirmed_send_refuses_broadcast() {
        let f = fixture();
        let mut apdu = BacnetBuf::from_slice(&[0x00, 0x05, 1, 12]);
        let result = f
            .app
            .send(&BacnetAddress::global_broadcast(), &mut apdu, NetworkPriority::Normal, true);
        assert!(matches!(result, Err(ApduError::BroadcastConfirmed(_))));
        assert!(f.network.frames().is_empty());
    }

    #[test]
    fn test_network_failure_reported() {
        let f = fixture();
        f.network.fail.store(true, Ordering::SeqCst);
        let mut apdu = BacnetBuf::from_slice(&[0x10, 0x08]);
        let result = f
            .app
            .send(&BacnetAddress::global_broadcast(), &mut apdu, NetworkPriority::Normal, false);
        assert!(matches!(result, Err(ApduError::Network(_))));
        assert_eq!(f.app.stats().sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_read_property_round_trip() {
        let f = fixture();
        bind_peer(&f);
        let log = Arc::new(EventLog::default());
        let reference = PropertyReference::new(
            ObjectIdentifier::new(ObjectType::AnalogInput, 3),
            PropertyIdentifier::PresentValue,
        );

        let invoker = f.app.read_property(PEER_DEVICE, &reference, log.handler()).unwrap();
        let frames = f.network.take();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].der);
        assert_eq!(frames[0].dst, peer());
        assert_eq!(frames[0].apdu[2], invoker.invoke_id().0);

        // a reply for a different service is not ours
        let mut wrong = BacnetBuf::new(BACNET_MAX_APDU);
        encode_complex_ack_header(&mut wrong, invoker.invoke_id().0, 14).unwrap();
        dispatch(&f.app, wrong.data());
        assert_eq!(log.len(), 0);

        let mut ack = BacnetBuf::new(BACNET_MAX_APDU);
        encode_complex_ack_header(&mut ack, invoker.invoke_id().0, 12).unwrap();
        let mut body = Vec::new();
        ReadPropertyAck {
            reference,
            value: vec![0x44, 0x42, 0x28, 0x00, 0x00],
        }
        .encode(&mut body)
        .unwrap();
        ack.put_slice(&body).unwrap();
        assert!(dispatch(&f.app, ack.data()).is_empty());

        assert_eq!(log.len(), 1);
        assert!(log.last().unwrap().starts_with("ComplexAck"));
        assert_eq!(f.app.stats().unmatched_replies.load(Ordering::Relaxed), 1);

        f.app.tsm().free_invoke_id(&invoker).unwrap();
        assert_eq!(f.app.tsm().invoker_count(), 0);
    }

    #[test]
    fn test_error_reply_reaches_invoker() {
        let f = fixture();
        bind_peer(&f);
        let log = Arc::new(EventLog::default());
        let invoker = f
            .app
            .request(PEER_DEVICE, ConfirmedServiceChoice::WriteProperty, &[0x0C], log.handler())
            .unwrap();

        let mut error = BacnetBuf::new(BACNET_MAX_APDU);
        encode_error_apdu(
            &mut error,
            invoker.invoke_id().0,
            ConfirmedServiceChoice::WriteProperty as u8,
            ErrorClass::Property,
            ErrorCode::WriteAccessDenied,
        )
        .unwrap();
        dispatch(&f.app, error.data());
        assert_eq!(
            log.last().as_deref(),
            Some("Error { class: Some(Property), code: Some(WriteAccessDenied) }")
        );
    }

    #[test]
    fn test_bare_error_reply_completes_invoker() {
        let f = fixture();
        bind_peer(&f);
        let log = Arc::new(EventLog::default());
        let invoker = f
            .app
            .request(PEER_DEVICE, ConfirmedServiceChoice::WriteProperty, &[0x0C], log.handler())
            .unwrap();

        let bare = [0x50, invoker.invoke_id().0, ConfirmedServiceChoice::WriteProperty as u8];
        assert!(dispatch(&f.app, &bare).is_empty());
        assert_eq!(log.len(), 1);
        assert_eq!(log.last().as_deref(), Some("Error { class: None, code: None }"));
        assert_eq!(f.app.stats().dropped.load(Ordering::Relaxed), 0);
        assert_eq!(f.app.tsm().next_deadline(), None);
    }

    #[test]
    fn test_request_timeout_and_unknown_device() {
        let f = fixture();
        let log = Arc::new(EventLog::default());
        let missing = f
            .app
            .request(PEER_DEVICE, ConfirmedServiceChoice::ReadProperty, &[], log.handler());
        assert!(matches!(missing, Err(ApduError::UnknownDevice(PEER_DEVICE))));
        assert_eq!(f.app.tsm().invoker_count(), 0);

        bind_peer(&f);
        f.network.take();
        let invoker = f
            .app
            .request(PEER_DEVICE, ConfirmedServiceChoice::ReadProperty, &[], log.handler())
            .unwrap();
        f.clock.advance(f.app.tsm().apdu_timeout());
        assert_eq!(f.app.tsm().process_timers(), 1);
        assert_eq!(log.last().as_deref(), Some("Timeout"));
        f.app.tsm().free_invoke_id(&invoker).unwrap();
    }

    #[test]
    fn test_communication_disabled() {
        let f = fixture();
        f.app
            .set_communication_control(CommunicationState::Disable, 0);

        let device = ObjectIdentifier::new(ObjectType::Device, DEVICE);
        assert!(dispatch(&f.app, &read_property(1, device, PropertyIdentifier::ObjectName)).is_empty());
        assert!(dispatch(&f.app, &[0x10, 0x08]).is_empty());
        assert!(f.network.frames().is_empty());

        let mut apdu = BacnetBuf::from_slice(&[0x10, 0x08]);
        let result = f
            .app
            .send(&BacnetAddress::global_broadcast(), &mut apdu, NetworkPriority::Normal, false);
        assert!(matches!(
            result,
            Err(ApduError::CommunicationDisabled(CommunicationState::Disable))
        ));
        assert!(f.app.send_i_am(&BacnetAddress::global_broadcast()).is_err());

        // DeviceCommunicationControl itself still gets through
        let mut dcc = vec![0x00, 0x05, 7, 17];
        DeviceCommunicationControlRequest {
            duration: 0,
            state: CommunicationState::Enable,
            password: None,
        }
        .encode(&mut dcc)
        .unwrap();
        assert_eq!(dispatch(&f.app, &dcc), vec![0x20, 7, 17]);
        assert!(f.app.communication_control().communication_enabled());
    }

    #[test]
    fn test_send_to_device_while_disabled() {
        let f = fixture();
        bind_peer(&f);
        f.app
            .set_communication_control(CommunicationState::Disable, 0);

        let mut apdu = BacnetBuf::from_slice(&[0x10, 0x08]);
        match f.app.send_to_device(PEER_DEVICE, &mut apdu, NetworkPriority::Normal, false) {
            Err(ApduError::CommunicationDisabled(CommunicationState::Disable)) => {}
            other => panic!("unexpected {:?}", other),
        }

        // resolving an unknown device would probe, but nothing may leave
        match f.app.send_to_device(PEER_DEVICE + 1, &mut apdu, NetworkPriority::Normal, false) {
            Err(ApduError::UnknownDevice(device)) => assert_eq!(device, PEER_DEVICE + 1),
            other => panic!("unexpected {:?}", other),
        }
        let log = Arc::new(EventLog::default());
        assert!(f
            .app
            .request(PEER_DEVICE, ConfirmedServiceChoice::ReadProperty, &[], log.handler())
            .is_err());
        assert_eq!(f.app.tsm().invoker_count(), 0);
        assert!(f.network.frames().is_empty());
        assert_eq!(f.app.stats().sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_initiation_disabled_still_answers_who_is() {
        let f = fixture();
        f.app
            .set_communication_control(CommunicationState::DisableInitiation, 5);

        dispatch(&f.app, &[0x10, 0x08]);
        assert_eq!(f.network.take().len(), 1);

        // I-Am from others is not processed
        dispatch(&f.app, &i_am(PEER_DEVICE, 480));
        assert!(f.app.binding().query_device_from_address(&peer()).is_none());

        // confirmed requests are still served
        let device = ObjectIdentifier::new(ObjectType::Device, DEVICE);
        let reply = dispatch(&f.app, &read_property(2, device, PropertyIdentifier::ObjectName));
        assert_eq!(reply[0], 0x30);

        let mut apdu = BacnetBuf::from_slice(&[0x10, 0x08]);
        assert!(f
            .app
            .send(&BacnetAddress::global_broadcast(), &mut apdu, NetworkPriority::Normal, false)
            .is_err());

        f.clock.advance(Duration::from_secs(5 * 60));
        assert!(f
            .app
            .send(&BacnetAddress::global_broadcast(), &mut apdu, NetworkPriority::Normal, false)
            .is_ok());
    }

    #[test]
    fn test_who_has_answered_with_i_have() {
        let f = fixture();
        let mut who_has = vec![0x10, 0x07];
        WhoHasRequest {
            range: None,
            object: WhoHasObject::Name("plant-room".to_string()),
        }
        .encode(&mut who_has)
        .unwrap();
        dispatch(&f.app, &who_has);

        let frames = f.network.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dst, BacnetAddress::global_broadcast());
        assert_eq!(&frames[0].apdu[..2], &[0x10, 0x01]);
    }
}

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bacnet_session::app::{encode_complex_ack_header, Apdu};
use bacnet_session::network::{self, NetworkLayer};
use bacnet_session::object::database::MemoryDatabase;
use bacnet_session::object::{ObjectIdentifier, PropertyIdentifier, PropertyReference};
use bacnet_session::service::property::encode_read_property_apdu;
use bacnet_session::util::ManualClock;
use bacnet_session::{
    ApplicationLayer, BacnetAddress, BacnetBuf, ConfirmedServiceChoice, Invoker, InvokerEvent, NetworkPriority, ObjectType,
    StackConfig, Tsm, TsmConfig, BACNET_MAX_APDU,
};

struct NullNetwork;

impl NetworkLayer for NullNetwork {
    fn send_pdu(
        &self,
        _dst: &BacnetAddress,
        apdu: &mut BacnetBuf,
        _priority: NetworkPriority,
        _der: bool,
    ) -> network::Result<()> {
        black_box(apdu.data());
        Ok(())
    }
}

fn stack() -> ApplicationLayer {
    let mut config = StackConfig::default();
    config.device.device_instance = 4001;
    ApplicationLayer::new(
        config,
        Arc::new(NullNetwork),
        Arc::new(MemoryDatabase::new(4001, "bench")),
        Arc::new(ManualClock::new()),
    )
}

fn decode_benchmark(c: &mut Criterion) {
    let mut buf = BacnetBuf::new(BACNET_MAX_APDU);
    let reference = PropertyReference::new(
        ObjectIdentifier::new(ObjectType::AnalogInput, 1),
        PropertyIdentifier::PresentValue,
    );
    encode_read_property_apdu(&mut buf, 1, &reference).unwrap();
    let request = buf.data().to_vec();

    c.bench_function("decode_confirmed_request", |b| {
        b.iter(|| black_box(Apdu::decode(black_box(&request)).unwrap()))
    });
}

fn dispatch_benchmark(c: &mut Criterion) {
    let app = stack();
    let src = BacnetAddress::local(&[10, 0, 0, 2, 0xBA, 0xC0]).unwrap();
    let mut reply = BacnetBuf::new(BACNET_MAX_APDU);

    let mut buf = BacnetBuf::new(BACNET_MAX_APDU);
    let reference = PropertyReference::new(
        ObjectIdentifier::new(ObjectType::Device, 4001),
        PropertyIdentifier::ObjectName,
    );
    encode_read_property_apdu(&mut buf, 1, &reference).unwrap();
    let read_property = buf.data().to_vec();

    c.bench_function("dispatch_read_property", |b| {
        b.iter(|| {
            app.handle_apdu(black_box(&read_property), &src, &mut reply);
            black_box(reply.len())
        })
    });

    let who_is = [0x10, 0x08];
    c.bench_function("dispatch_who_is", |b| {
        b.iter(|| app.handle_apdu(black_box(&who_is), &src, &mut reply))
    });
}

fn transaction_benchmark(c: &mut Criterion) {
    let app = stack();
    let tsm: &Arc<Tsm> = app.tsm();
    let peer = BacnetAddress::local(&[10, 0, 0, 3, 0xBA, 0xC0]).unwrap();
    let mut reply = BacnetBuf::new(BACNET_MAX_APDU);

    c.bench_function("transaction_round_trip", |b| {
        b.iter(|| {
            let invoker = tsm
                .alloc_invoke_id(&peer, ConfirmedServiceChoice::ReadProperty, |_: &Invoker, event: InvokerEvent<'_>| {
                    black_box(event);
                })
                .unwrap();
            let id = invoker.invoke_id().0;
            let mut apdu = BacnetBuf::from_slice(&[0x00, 0x05, id, 12]);
            app.send_confirmed(&invoker, &mut apdu, NetworkPriority::Normal, None)
                .unwrap();

            let mut ack = BacnetBuf::new(16);
            encode_complex_ack_header(&mut ack, id, 12).unwrap();
            app.handle_apdu(ack.data(), &peer, &mut reply);
            tsm.free_invoke_id(&invoker).unwrap();
        })
    });

    c.bench_function("alloc_free_full_peer", |b| {
        let standalone = Tsm::new(TsmConfig::default(), Arc::new(ManualClock::new()), app.transmitter().clone());
        b.iter(|| {
            let invokers: Vec<_> = (0..255)
                .map(|_| {
                    standalone
                        .alloc_invoke_id(&peer, ConfirmedServiceChoice::ReadProperty, |_: &Invoker, _: InvokerEvent<'_>| {})
                        .unwrap()
                })
                .collect();
            for invoker in &invokers {
                standalone.free_invoke_id(invoker).unwrap();
            }
        })
    });
}

criterion_group!(benches, decode_benchmark, dispatch_benchmark, transaction_benchmark);
criterion_main!(benches);

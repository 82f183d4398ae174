use std::cell::RefCell;
use std::rc::Rc;

use matches::assert_matches;

use crate::att::ErrorCode;
use crate::gap::{Characteristic, Descriptor, Service};

use super::sim::{Db, QueryKind, QueryKind::*, Sim};
use super::*;

/// Recorded client event.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Rec {
    Connected(ConnHandle, ConnectionId, Status),
    Disconnected(ConnHandle, ConnectionId),
    Value(ConnectionId, usize, ValueKind, Vec<u8>),
    Read(ConnectionId, usize, att::Result<()>, Vec<u8>),
    Write(ConnectionId, usize, att::Result<()>),
}

impl From<&ClientEvent<'_>> for Rec {
    fn from(e: &ClientEvent<'_>) -> Self {
        match *e {
            ClientEvent::Connected { link, cid, status } => Self::Connected(link, cid, status),
            ClientEvent::Disconnected { link, cid } => Self::Disconnected(link, cid),
            ClientEvent::Value {
                cid,
                index,
                kind,
                value,
                ..
            } => Self::Value(cid, index, kind, value.to_vec()),
            ClientEvent::ReadValue {
                cid,
                index,
                status,
                value,
            } => Self::Read(cid, index, status, value.to_vec()),
            ClientEvent::WriteDone { cid, index, status } => Self::Write(cid, index, status),
        }
    }
}

type Log = Rc<RefCell<Vec<Rec>>>;

fn recorder() -> (Log, impl FnMut(&ClientEvent<'_>)) {
    let log = Log::default();
    let tx = Rc::clone(&log);
    (log, move |e: &ClientEvent<'_>| tx.borrow_mut().push(Rec::from(e)))
}

fn take(log: &Log) -> Vec<Rec> {
    std::mem::take(&mut *log.borrow_mut())
}

fn link(h: u16) -> ConnHandle {
    ConnHandle::new(h).unwrap()
}

fn hdl(h: u16) -> Handle {
    Handle::new(h).unwrap()
}

fn slots(n: usize) -> Vec<CharSlot> {
    vec![CharSlot::default(); n]
}

/// Checks that every discovered value handle is inside the service range.
fn assert_handles_in_service(c: &Connection) {
    let r = c.range().expect("service range not discovered");
    for h in c.chars().iter().filter_map(|c| c.value) {
        assert!(r.contains(&h), "{h} outside of {r:?}");
    }
}

fn kinds(sc: &ServiceClients<Sim>, l: ConnHandle) -> Vec<QueryKind> {
    (sc.transport().issued().iter())
        .filter(|&&(h, _)| h == l)
        .map(|&(_, k)| k)
        .collect()
}

/// Generic Access at 0x0001..=0x0003, Battery at 0x0004..=0x0007 with the
/// level value at 0x0006 and its CCCD at 0x0007.
fn battery_db() -> Db {
    let mut db = Db::new();
    db.primary(Service::GenericAccess, |s| {
        s.characteristic(Characteristic::DeviceName, CharProps::READ, b"sim");
    });
    db.primary(Service::Battery, |s| {
        s.characteristic(Characteristic::BatteryLevel, CharProps::READ | CharProps::NOTIFY, &[87])
            .cccd();
    });
    db
}

/// Engine with one battery client connected on link 0x0040.
fn battery() -> (ServiceClients<Sim>, Log, ServiceClientId, ConnectionId) {
    let mut sc = ServiceClients::new(Sim::new());
    sc.transport_mut().connect(link(0x40), battery_db());
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let cid = (sc.connect(link(0x40), id, Target::new(Service::Battery), slots(1))).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(link(0x40), cid, Status::Success)]);
    (sc, log, id, cid)
}

#[test]
fn notify_after_discovery() {
    let (mut sc, log, id, cid) = battery();
    let l = link(0x40);
    assert_eq!(kinds(&sc, l), [PrimaryService, Characteristics, Descriptors, ClientCfg]);
    let c = sc.connection(id, cid).unwrap();
    assert_eq!(c.state(), &State::Connected(Op::Idle));
    assert_eq!(c.range(), HandleRange::from_raw(4, 7));
    assert_eq!(
        c.chars(),
        [CharSlot {
            value: Some(hdl(6)),
            end: Some(hdl(7)),
            props: CharProps::READ | CharProps::NOTIFY,
            cfg: Some(hdl(7)),
        }]
    );
    assert_eq!(sc.transport().client_cfg(l, hdl(7)), Cccd::NOTIFY);
    assert_eq!(sc.transport().listeners(l), 1);

    assert!(sc.transport_mut().notify(l, hdl(6), &[42]));
    sc.run();
    assert_eq!(take(&log), [Rec::Value(cid, 0, ValueKind::Notification, vec![42])]);
    assert!(!sc.transport_mut().notify(l, hdl(3), &[1]));
    assert_eq!(sc.transport().violations(), 0);
}

#[test]
fn missing_characteristic() {
    let mut db = Db::new();
    db.primary(Service::Battery, |s| {
        s.characteristic(Characteristic::DeviceName, CharProps::READ, &[]);
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(1))).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    assert_eq!(kinds(&sc, l), [PrimaryService, Characteristics]);
    assert_eq!(sc.connection(id, cid).unwrap().value_handle(0), None);
    assert_eq!(
        sc.read(id, cid, 0),
        Err(Status::UnsupportedFeatureOrParameterValue)
    );
    assert_eq!(
        sc.read(id, cid, 1),
        Err(Status::UnsupportedFeatureOrParameterValue)
    );
}

#[test]
fn service_discovery_error() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, battery_db());
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);

    let t = Target::new(Service::Battery);
    (sc.transport_mut()).fail(l, PrimaryService, ErrorCode::InvalidAttributeValueLength);
    let cid = sc.connect(l, id, t, slots(1)).unwrap();
    sc.run();
    assert_eq!(
        take(&log),
        [Rec::Connected(l, cid, Status::ParameterOutOfMandatoryRange)]
    );
    assert_eq!(kinds(&sc, l), [PrimaryService]);
    assert!(sc.connection(id, cid).is_none());

    (sc.transport_mut()).fail(l, PrimaryService, ErrorCode::InsufficientAuthentication);
    let cid = sc.connect(l, id, t, slots(1)).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::UnspecifiedError)]);
    assert_eq!(sc.connections(id).count(), 0);
}

#[test]
fn service_not_found() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, battery_db());
    let (log, h) = recorder();
    let id = sc.register([Characteristic::AlertLevel], h);
    let cid = (sc.connect(l, id, Target::new(Service::LinkLoss), slots(1))).unwrap();
    sc.run();
    assert_eq!(
        take(&log),
        [Rec::Connected(l, cid, Status::UnsupportedFeatureOrParameterValue)]
    );
    assert_eq!(kinds(&sc, l), [PrimaryService]);
}

#[test]
fn characteristic_discovery_error() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, battery_db());
    (sc.transport_mut()).fail(l, Characteristics, ErrorCode::InsufficientEncryption);
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(1))).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::UnspecifiedError)]);
    assert_eq!(kinds(&sc, l), [PrimaryService, Characteristics]);
}

#[test]
fn disconnect_during_descriptors() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, battery_db());
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(1))).unwrap();
    while let Some(e) = sc.transport_mut().next_event() {
        sc.handle(e);
        let st = sc.connection(id, cid).unwrap().state();
        if matches!(*st, State::AwaitDescriptors(_)) {
            break;
        }
    }
    sc.handle(Event::Disconnected(l));
    assert_eq!(take(&log), [Rec::Disconnected(l, cid)]);
    assert!(sc.connection(id, cid).is_none());

    // Descriptor results and completion are still queued
    sc.transport_mut().disconnect(l);
    assert!(sc.run() >= 3);
    assert!(take(&log).is_empty());
    assert_eq!(kinds(&sc, l), [PrimaryService, Characteristics, Descriptors]);
}

#[test]
fn link_loss_after_connect() {
    let (mut sc, log, id, cid) = battery();
    let l = link(0x40);
    sc.transport_mut().disconnect(l);
    sc.run();
    assert_eq!(take(&log), [Rec::Disconnected(l, cid)]);
    assert_eq!(sc.connections(id).count(), 0);
    assert_eq!(
        sc.connect(l, id, Target::new(Service::Battery), slots(1)),
        Err(Status::UnknownConnectionIdentifier)
    );
    assert_eq!(sc.connections(id).count(), 0);
}

#[test]
fn duplicate_connect() {
    let (mut sc, _log, id, _) = battery();
    let l = link(0x40);
    let t = Target::new(Service::Battery);
    assert_eq!(sc.connect(l, id, t, slots(1)), Err(Status::CommandDisallowed));
    assert!(sc.connect(l, id, t.with_index(1), slots(1)).is_ok());
    assert_eq!(sc.connections(id).count(), 2);
}

#[test]
fn undersized_storage() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, battery_db());
    let (log, h) = recorder();
    let uuids = [Characteristic::BatteryLevel, Characteristic::BatteryLevel];
    let id = sc.register(uuids, h);
    assert_eq!(sc.char_count(id), 2);
    assert_eq!(
        sc.connect(l, id, Target::new(Service::Battery), slots(1)),
        Err(Status::MemoryCapacityExceeded)
    );
    assert_eq!(sc.run(), 0);
    assert!(take(&log).is_empty());

    // Extra slots are not used
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(4))).unwrap();
    sc.run();
    assert_eq!(sc.connection(id, cid).unwrap().chars().len(), 2);
}

#[test]
fn disconnect_idempotent() {
    let (mut sc, log, id, cid) = battery();
    let l = link(0x40);
    assert_eq!(sc.disconnect(id, cid), Ok(()));
    assert_eq!(take(&log), [Rec::Disconnected(l, cid)]);
    assert_eq!(sc.transport().listeners(l), 0);
    assert_eq!(sc.disconnect(id, cid), Err(Status::UnknownConnectionIdentifier));
    assert!(take(&log).is_empty());
    assert!(!sc.transport_mut().notify(l, hdl(6), &[1]));
}

#[test]
fn repeated_uuids() {
    let mut db = Db::new();
    db.primary(Service::Battery, |s| {
        s.characteristic(Characteristic::BatteryLevel, CharProps::READ, &[1])
            .characteristic(Characteristic::BatteryLevel, CharProps::READ, &[2]);
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    let (log, h) = recorder();
    let uuids = [Characteristic::BatteryLevel, Characteristic::BatteryLevel];
    let id = sc.register(uuids, h);
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(2))).unwrap();
    sc.run();
    let c = sc.connection(id, cid).unwrap();
    assert_handles_in_service(c);
    assert_eq!((c.value_handle(0), c.value_handle(1)), (Some(hdl(3)), Some(hdl(5))));
    assert_eq!(c.chars()[0].end, Some(hdl(3)));

    sc.read(id, cid, 1).unwrap();
    sc.run();
    assert_eq!(
        take(&log),
        [
            Rec::Connected(l, cid, Status::Success),
            Rec::Read(cid, 1, Ok(()), vec![2]),
        ]
    );
}

#[test]
fn client_cfg_failure_continues() {
    let mut db = Db::new();
    db.primary(Service::HeartRate, |s| {
        s.characteristic(Characteristic::HeartRateMeasurement, CharProps::NOTIFY, &[])
            .cccd()
            .characteristic(Characteristic::BodySensorLocation, CharProps::INDICATE, &[])
            .cccd();
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    (sc.transport_mut()).fail(l, ClientCfg, ErrorCode::WriteNotPermitted);
    let (log, h) = recorder();
    let uuids = [
        Characteristic::HeartRateMeasurement,
        Characteristic::BodySensorLocation,
    ];
    let id = sc.register(uuids, h);
    let cid = (sc.connect(l, id, Target::new(Service::HeartRate), slots(2))).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    assert_eq!(
        kinds(&sc, l),
        [PrimaryService, Characteristics, Descriptors, Descriptors, ClientCfg, ClientCfg]
    );
    let c = sc.connection(id, cid).unwrap();
    assert_eq!((c.chars()[0].cfg, c.chars()[1].cfg), (None, Some(hdl(7))));
    assert_eq!(sc.transport().client_cfg(l, hdl(4)), Cccd::empty());
    assert_eq!(sc.transport().client_cfg(l, hdl(7)), Cccd::INDICATE);

    assert!(sc.transport_mut().notify(l, hdl(6), &[3]));
    sc.run();
    assert_eq!(take(&log), [Rec::Value(cid, 1, ValueKind::Indication, vec![3])]);
}

#[test]
fn client_cfg_refused_continues() {
    let mut db = Db::new();
    db.primary(Service::HeartRate, |s| {
        s.characteristic(Characteristic::HeartRateMeasurement, CharProps::NOTIFY, &[])
            .cccd()
            .characteristic(Characteristic::BodySensorLocation, CharProps::INDICATE, &[])
            .cccd();
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    (sc.transport_mut()).refuse(l, ClientCfg, Status::ControllerBusy);
    let (log, h) = recorder();
    let uuids = [
        Characteristic::HeartRateMeasurement,
        Characteristic::BodySensorLocation,
    ];
    let id = sc.register(uuids, h);
    let cid = (sc.connect(l, id, Target::new(Service::HeartRate), slots(2))).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    assert_eq!(
        kinds(&sc, l),
        [PrimaryService, Characteristics, Descriptors, Descriptors, ClientCfg]
    );
    let c = sc.connection(id, cid).unwrap();
    assert_eq!(c.state(), &State::Connected(Op::Idle));
    assert_eq!((c.chars()[0].cfg, c.chars()[1].cfg), (None, Some(hdl(7))));
    assert_eq!(sc.transport().client_cfg(l, hdl(4)), Cccd::empty());
    assert_eq!(sc.transport().client_cfg(l, hdl(7)), Cccd::INDICATE);
    assert_eq!(sc.transport().violations(), 0);

    assert!(sc.transport_mut().notify(l, hdl(6), &[1]));
    sc.run();
    assert_eq!(take(&log), [Rec::Value(cid, 1, ValueKind::Indication, vec![1])]);
}

#[test]
fn notify_without_cccd() {
    let mut db = Db::new();
    db.primary(Service::HeartRate, |s| {
        s.characteristic(Characteristic::HeartRateMeasurement, CharProps::NOTIFY, &[])
            .characteristic(Characteristic::BodySensorLocation, CharProps::NOTIFY, &[])
            .descriptor(Descriptor::CharacteristicUserDescription);
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    let (log, h) = recorder();
    let uuids = [
        Characteristic::HeartRateMeasurement,
        Characteristic::BodySensorLocation,
    ];
    let id = sc.register(uuids, h);
    let cid = (sc.connect(l, id, Target::new(Service::HeartRate), slots(2))).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    // The first characteristic has no room for descriptors
    assert_eq!(kinds(&sc, l), [PrimaryService, Characteristics, Descriptors]);
    let c = sc.connection(id, cid).unwrap();
    assert!(c.chars().iter().all(|c| c.cfg.is_none()));
    assert_eq!(sc.transport().listeners(l), 1);
}

#[test]
fn read_write() {
    let (mut sc, log, id, cid) = battery();
    let l = link(0x40);
    sc.read(id, cid, 0).unwrap();
    assert_eq!(sc.read(id, cid, 0), Err(Status::ControllerBusy));
    assert_eq!(sc.write(id, cid, 0, &[1]), Err(Status::ControllerBusy));
    sc.run();
    assert_eq!(take(&log), [Rec::Read(cid, 0, Ok(()), vec![87])]);

    sc.write(id, cid, 0, &[50]).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Write(cid, 0, Ok(()))]);
    assert_eq!(sc.transport().value(l, hdl(6)), Some(&[50][..]));

    (sc.transport_mut()).fail(l, Read, ErrorCode::ReadNotPermitted);
    sc.read(id, cid, 0).unwrap();
    sc.run();
    assert_eq!(
        take(&log),
        [Rec::Read(cid, 0, Err(ErrorCode::ReadNotPermitted), vec![])]
    );

    (sc.transport_mut()).fail(l, Write, ErrorCode::WriteNotPermitted);
    sc.write(id, cid, 0, &[1]).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Write(cid, 0, Err(ErrorCode::WriteNotPermitted))]);

    assert_eq!(
        sc.write(id, cid, 0, &[0; att::MAX_VAL_LEN + 1]),
        Err(Status::ParameterOutOfMandatoryRange)
    );
    assert_matches!(sc.write(id, cid, 0, &[0; att::MAX_VAL_LEN]), Ok(()));
    sc.run();
    assert_matches!(take(&log).as_slice(), [Rec::Write(_, 0, Ok(()))]);

    let bad = ConnectionId::new(99).unwrap();
    assert_eq!(sc.read(id, bad, 0), Err(Status::UnknownConnectionIdentifier));
    assert_eq!(sc.can_query(id, cid, 0), Ok(()));
    assert_eq!(sc.transport().violations(), 0);
}

#[test]
fn read_before_connected() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, battery_db());
    let (_log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(1))).unwrap();
    assert_eq!(sc.read(id, cid, 0), Err(Status::CommandDisallowed));
    assert_eq!(sc.can_query(id, cid, 0), Err(Status::CommandDisallowed));
    assert_matches!(
        sc.connection(id, cid).unwrap().state(),
        State::WantPrimaryService
    );
}

#[test]
fn serialized_per_link() {
    let mut sc = ServiceClients::new(Sim::new());
    let (a, b) = (link(1), link(2));
    sc.transport_mut().connect(a, battery_db());
    sc.transport_mut().connect(b, battery_db());
    let (log, h) = recorder();
    let bas = sc.register([Characteristic::BatteryLevel], h);
    let (gap_log, h) = recorder();
    let gap = sc.register([Characteristic::DeviceName], h);

    let mut cids = Vec::new();
    for l in [a, b] {
        cids.push(sc.connect(l, bas, Target::new(Service::Battery), slots(1)).unwrap());
        cids.push(sc.connect(l, gap, Target::new(Service::GenericAccess), slots(1)).unwrap());
    }
    sc.run();
    assert_eq!(sc.transport().violations(), 0);
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(gap_log.borrow().len(), 2);
    assert!((log.borrow().iter().chain(gap_log.borrow().iter()))
        .all(|r| matches!(*r, Rec::Connected(_, _, Status::Success))));
    assert_eq!(kinds(&sc, a).len(), 6);
    assert_eq!(kinds(&sc, b).len(), 6);

    // Operations of different clients on one link are queued
    sc.read(bas, cids[0], 0).unwrap();
    sc.read(gap, cids[1], 0).unwrap();
    sc.run();
    assert_eq!(sc.transport().violations(), 0);
    assert_eq!(take(&gap_log)[2..], [Rec::Read(cids[1], 0, Ok(()), b"sim".to_vec())]);
}

#[test]
fn stale_events() {
    let (mut sc, log, id, cid) = battery();
    let other = ConnectionId::new(u16::from(cid) + 1).unwrap();
    sc.handle(Event::QueryComplete(Context { client: id, cid: other }, Ok(())));
    let unregistered = ServiceClientId::new(99).unwrap();
    sc.handle(Event::CanSendNow(Context {
        client: unregistered,
        cid,
    }));
    sc.handle(Event::Disconnected(link(0x123)));

    // Unexpected events for a live connection do not change its state
    let ctx = Context { client: id, cid };
    sc.handle(Event::CanSendNow(ctx));
    sc.handle(Event::QueryComplete(ctx, Err(ErrorCode::UnlikelyError)));
    assert!(take(&log).is_empty());
    assert_eq!(
        sc.connection(id, cid).unwrap().state(),
        &State::Connected(Op::Idle)
    );
    assert_eq!(sc.transport().violations(), 0);
}

#[test]
fn secondary_service() {
    let mut db = Db::new();
    db.primary(Service::GenericAccess, |s| {
        s.characteristic(Characteristic::DeviceName, CharProps::READ, b"sim");
    });
    let range = db.secondary(Service::Battery, |s| {
        s.characteristic(Characteristic::BatteryLevel, CharProps::NOTIFY, &[10])
            .cccd();
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);

    let t = Target::new(Service::Battery);
    let cid = sc.connect_secondary(l, id, t, range, slots(1)).unwrap();
    let overlap = HandleRange::from_raw(7, 9).unwrap();
    assert_eq!(
        sc.connect_secondary(l, id, t.with_index(1), overlap, slots(1)),
        Err(Status::CommandDisallowed)
    );
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    assert_eq!(kinds(&sc, l), [Characteristics, Descriptors, ClientCfg]);
    assert_eq!(sc.connection(id, cid).unwrap().range(), Some(range));

    // Primary discovery does not find secondary services
    let cid = sc.connect(l, id, t.with_index(1), slots(1)).unwrap();
    sc.run();
    assert_eq!(
        take(&log),
        [Rec::Connected(l, cid, Status::UnsupportedFeatureOrParameterValue)]
    );
}

#[test]
fn secondary_service_conflicts() {
    let mut db = Db::new();
    let r1 = db.secondary(Service::Battery, |s| {
        s.characteristic(Characteristic::BatteryLevel, CharProps::READ, &[1]);
    });
    let r2 = db.secondary(Service::Battery, |s| {
        s.characteristic(Characteristic::BatteryLevel, CharProps::READ, &[2]);
    });
    db.primary(Service::Battery, |s| {
        s.characteristic(Characteristic::BatteryLevel, CharProps::READ, &[3]);
    });
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(1);
    sc.transport_mut().connect(l, db);
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let t = Target::new(Service::Battery);

    let a = sc.connect_secondary(l, id, t, r1, slots(1)).unwrap();
    assert_eq!(
        sc.connect_secondary(l, id, t, r2, slots(1)),
        Err(Status::CommandDisallowed)
    );
    let all = HandleRange::from_raw(1, 0x20).unwrap();
    assert_eq!(
        sc.connect_secondary(l, id, t.with_index(1), all, slots(1)),
        Err(Status::CommandDisallowed)
    );
    let b = sc.connect_secondary(l, id, t.with_index(1), r2, slots(1)).unwrap();

    // The primary service range is unknown until discovery finishes
    let c = sc.connect(l, id, t.with_index(2), slots(1)).unwrap();
    let unused = HandleRange::from_raw(0x30, 0x31).unwrap();
    assert_eq!(
        sc.connect_secondary(l, id, t.with_index(2), unused, slots(1)),
        Err(Status::CommandDisallowed)
    );
    assert_eq!(sc.connections(id).count(), 3);

    sc.run();
    let events = take(&log);
    assert_eq!(events.len(), 3);
    for cid in [a, b, c] {
        assert!(events.contains(&Rec::Connected(l, cid, Status::Success)));
        assert_handles_in_service(sc.connection(id, cid).unwrap());
    }
    let value = |cid| sc.connection(id, cid).and_then(|c| c.value_handle(0));
    assert_eq!((value(a), value(b), value(c)), (Some(hdl(3)), Some(hdl(6)), Some(hdl(9))));
}

#[test]
fn value_handles_within_service() {
    let mut sc = ServiceClients::new(Sim::new());
    let l = link(0x40);
    sc.transport_mut().connect(l, battery_db());
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);
    let cid = (sc.connect(l, id, Target::new(Service::Battery), slots(1))).unwrap();
    while sc.connection(id, cid).map(Connection::state) != Some(&State::AwaitCharacteristics) {
        let e = sc.transport_mut().next_event().unwrap();
        sc.handle(e);
    }
    let stray = CharDecl {
        decl: hdl(0x1F),
        value: hdl(0x20),
        end: hdl(0x21),
        props: CharProps::NOTIFY,
        uuid: Characteristic::BatteryLevel.uuid(),
    };
    sc.handle(Event::Characteristic(Context { client: id, cid }, stray));
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    let c = sc.connection(id, cid).unwrap();
    assert_handles_in_service(c);
    assert_eq!(c.value_handle(0), Some(hdl(6)));
    assert_eq!(c.chars()[0].cfg, Some(hdl(7)));
}

#[test]
fn unregister_silent() {
    let (mut sc, log, id, cid) = battery();
    let l = link(0x40);
    sc.read(id, cid, 0).unwrap();
    sc.unregister(id);
    assert_eq!(sc.transport().listeners(l), 0);
    sc.run();
    sc.transport_mut().disconnect(l);
    sc.run();
    assert!(take(&log).is_empty());
}

#[test]
#[should_panic(expected = "16- and 128-bit")]
fn mixed_uuid_sizes() {
    let mut sc = ServiceClients::new(Sim::new());
    let long = Uuid::new(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E).unwrap();
    sc.register([Characteristic::BatteryLevel.uuid(), long], |_| {});
}

#[test]
fn mtu() {
    let (mut sc, _log, id, cid) = battery();
    assert_eq!(sc.mtu(id, cid), Some(att::DEFAULT_MTU));
    sc.transport_mut().set_mtu(link(0x40), 247);
    assert_eq!(sc.mtu(id, cid), Some(247));
    assert_eq!(sc.char_uuid(id, 0), Some(Characteristic::BatteryLevel.uuid()));
    assert_eq!(sc.char_uuid(id, 1), None);
}

#[test]
fn ungranted_procedure() {
    let mut sim = Sim::new();
    let l = link(1);
    sim.connect(l, battery_db());
    let ctx = Context {
        client: ServiceClientId::new(1).unwrap(),
        cid: ConnectionId::new(1).unwrap(),
    };
    let uuid = Service::Battery.uuid();
    assert_eq!(
        sim.discover_primary_service(l, uuid, ctx),
        Err(Status::CommandDisallowed)
    );
    assert_eq!(sim.violations(), 1);
    sim.request_to_send(l, ctx).unwrap();
    assert_eq!(sim.next_event(), Some(Event::CanSendNow(ctx)));
    assert_eq!(sim.discover_primary_service(l, uuid, ctx), Ok(()));
    assert_eq!(sim.next_event().and_then(|e| e.context()), Some(ctx));
    assert_eq!(
        sim.request_to_send(link(2), ctx),
        Err(Status::UnknownConnectionIdentifier)
    );
}

#[test]
fn id_wraparound() {
    let max = ConnectionId::new(u16::MAX);
    assert_eq!(ConnectionId::next_free(max, |_| false), ConnectionId::new(1));
    let two = ConnectionId::new(2).unwrap();
    assert_eq!(
        ConnectionId::next_free(None, |id| id != two),
        Some(two)
    );
    assert_eq!(ServiceClientId::next_free(None, |_| true), None);
}

#[test]
fn att_error_status() {
    assert_eq!(
        Status::from(ErrorCode::InvalidAttributeValueLength),
        Status::ParameterOutOfMandatoryRange
    );
    assert_eq!(Status::from(ErrorCode::InvalidHandle), Status::UnspecifiedError);
}

#[cfg(feature = "cache")]
#[test]
fn cache_round_trip() {
    use std::sync::Arc;

    use super::cache::{self, CacheStore, CacheTag, MemStore};

    let store = Arc::new(MemStore::new());
    let mut sc = ServiceClients::new(Sim::new()).with_cache(Arc::clone(&store));
    let l = link(0x40);
    sc.transport_mut().connect(l, battery_db());
    let (log, h) = recorder();
    let id = sc.register([Characteristic::BatteryLevel], h);

    let tag = CacheTag::new(1, 0, 0xABCD);
    let t = Target::new(Service::Battery).with_cache(tag);
    let cid = sc.connect(l, id, t, slots(1)).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    let blob = store.load(tag.key()).unwrap();
    assert_matches!(cache::decode(&blob), Ok((_, ref v)) if v[..] == [Some(hdl(6))]);
    sc.disconnect(id, cid).unwrap();
    take(&log);

    // Reconnection uses the stored handles without any discovery
    let n = sc.transport().issued().len();
    let cid = sc.connect(l, id, t, slots(1)).unwrap();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    assert_eq!(sc.run(), 0);
    assert_eq!(sc.transport().issued().len(), n);
    assert_eq!(sc.connection(id, cid).unwrap().value_handle(0), Some(hdl(6)));
    assert!(sc.transport_mut().notify(l, hdl(6), &[42]));
    sc.run();
    assert_eq!(take(&log), [Rec::Value(cid, 0, ValueKind::Notification, vec![42])]);
    sc.read(id, cid, 0).unwrap();
    sc.run();
    assert_eq!(take(&log), [Rec::Read(cid, 0, Ok(()), vec![87])]);
    sc.disconnect(id, cid).unwrap();
    take(&log);

    // A different database hash invalidates the entry
    let t = t.with_cache(CacheTag::new(1, 0, 0xABCE));
    let cid = sc.connect(l, id, t, slots(1)).unwrap();
    assert!(take(&log).is_empty());
    sc.run();
    assert_eq!(take(&log), [Rec::Connected(l, cid, Status::Success)]);
    assert_eq!(sc.transport().issued().len(), n + 4);
    assert_eq!(store.len(), 1);

    // So does a different service index
    sc.disconnect(id, cid).unwrap();
    take(&log);
    let cid = sc.connect(l, id, t.with_index(1), slots(1)).unwrap();
    sc.run();
    assert_eq!(
        take(&log),
        [Rec::Connected(l, cid, Status::Success)]
    );
    assert_eq!(sc.transport().issued().len(), n + 8);
}

mod common;

use common::{BusOp, node, past_deadline};

use twinet::bus::BusEvent;
use twinet::dispatcher::{CHANNEL_COUNT, CHANNEL_DEPTH, LOCAL_ADDR};
use twinet::frame::{Command, Frame};


#[test]
fn register_assigns_lowest_free_channel() {
    let (dispatcher, _, _) = node();

    let first = dispatcher.register(0, 0).unwrap();
    assert_eq!(first.index(), 0);
    // the requested channel is taken, the next free one is granted
    let second = dispatcher.register(0, 0).unwrap();
    assert_eq!(second.index(), 1);
    let high = dispatcher.register(5, 0).unwrap();
    assert_eq!(high.index(), 5);

    // out of range requests are refused outright
    assert!(dispatcher.register(CHANNEL_COUNT, 0).is_none());

    for index in [2, 3, 4, 6, 7, 8, 9] {
        assert_eq!(dispatcher.register(2, 0).unwrap().index(), index);
    }
    // every channel is now taken
    assert!(dispatcher.register(0, 0).is_none());
}

#[test]
fn transmit_needs_the_channel_lock() {
    let (dispatcher, _, _) = node();
    let app = dispatcher.register(3, 0).unwrap();

    let mut frame = Frame::request(0x20, LOCAL_ADDR, Command::State);
    assert!(app.transmit(&mut frame).is_err());

    app.lock();
    assert!(app.transmit(&mut frame).is_ok());
}

#[test]
fn higher_priority_lock_blocks_lower_channels() {
    let (dispatcher, _, _) = node();
    let high = dispatcher.register(0, 0).unwrap();
    let low = dispatcher.register(5, 0).unwrap();
    let mut frame = Frame::request(0x20, LOCAL_ADDR, Command::State);

    low.lock();
    assert!(low.transmit(&mut frame).is_ok());
    dispatcher.poll();

    // a held higher-priority lock makes every lower transmission busy,
    // whatever the lower channel's own lock state
    high.lock();
    assert!(low.transmit(&mut frame).is_err());
    assert!(high.transmit(&mut frame).is_ok());
    dispatcher.poll();

    high.unlock();
    assert!(low.transmit(&mut frame).is_ok());
}

#[test]
fn transaction_ids_increase_and_responses_consume_none() {
    let (dispatcher, _, _) = node();
    let app = dispatcher.register(0, 0).unwrap();
    app.lock();

    let mut ids = Vec::new();
    for _ in 0 .. 5 {
        let mut frame = Frame::request(0x20, LOCAL_ADDR, Command::State);
        app.transmit(&mut frame).unwrap();
        ids.push(frame.t_id);
        dispatcher.poll();
        dispatcher.bus_event(BusEvent::MasterWriteDone);
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    // a response keeps whatever id it already carries
    let mut response = Frame::request(0x20, LOCAL_ADDR, Command::State);
    response.t_id = 0xaa;
    response.stat.set_resp(true);
    app.transmit(&mut response).unwrap();
    assert_eq!(response.t_id, 0xaa);
    dispatcher.poll();
    dispatcher.bus_event(BusEvent::MasterWriteDone);

    let mut frame = Frame::request(0x20, LOCAL_ADDR, Command::State);
    app.transmit(&mut frame).unwrap();
    assert_eq!(frame.t_id, 6);
}

#[test]
fn local_frames_never_touch_the_bus() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();
    app.lock();
    bus.take_ops();

    let mut frame = Frame::request(LOCAL_ADDR, LOCAL_ADDR, Command::State).args([1, 2]);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    let received = app.receive().unwrap();
    assert_eq!(received.cmde, Command::State);
    assert_eq!(&received.argv[.. 2], &[1, 2]);
    assert!(bus.take_transfers().is_empty());
}

#[test]
fn own_address_frames_are_delivered_locally() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();
    dispatcher.set_self_address(0x09);
    app.lock();
    bus.take_ops();

    let mut frame = Frame::request(0x09, 0x09, Command::State);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    assert!(app.receive().is_some());
    assert!(bus.take_transfers().is_empty());
}

#[test]
fn broadcast_goes_both_locally_and_on_the_bus() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();
    app.lock();
    bus.take_ops();

    let mut frame = Frame::request(0x00, LOCAL_ADDR, Command::State).args([7]);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    assert!(app.receive().is_some());
    let transfers = bus.take_transfers();
    assert_eq!(transfers.len(), 1);
    let BusOp::Write {dest, data} = &transfers[0] else {panic!("expected a write")};
    assert_eq!(*dest, 0x00);
    let sent = Frame::from_body(0x00, data).unwrap();
    assert_eq!(sent.cmde, Command::State);
    // the bus copy is tagged with the node's own address
    assert_eq!(sent.orig, LOCAL_ADDR);
}

#[test]
fn passthrough_read_synthesizes_a_local_response() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, Command::TwiRead.mask()).unwrap();
    app.lock();
    bus.take_ops();

    let mut frame = Frame::request(0x42, LOCAL_ADDR, Command::TwiRead).args([3]);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    assert_eq!(bus.take_transfers(), vec![BusOp::Read {dest: 0x42, len: 3}]);

    dispatcher.bus_event(BusEvent::MasterReadDone(&[0xaa, 0xbb, 0xcc]));
    dispatcher.poll();

    let response = app.receive().unwrap();
    assert!(response.stat.resp());
    assert!(!response.stat.error());
    assert_eq!(response.t_id, frame.t_id);
    assert_eq!(response.orig, 0x42);
    assert_eq!(&response.argv[1 .. 4], &[0xaa, 0xbb, 0xcc]);
}

#[test]
fn passthrough_write_sends_the_arguments_raw() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, Command::TwiWrite.mask()).unwrap();
    app.lock();
    bus.take_ops();

    let mut frame = Frame::request(0x42, LOCAL_ADDR, Command::TwiWrite).args([2, 0x11, 0x22]);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    assert_eq!(bus.take_transfers(), vec![BusOp::Write {dest: 0x42, data: vec![0x11, 0x22]}]);

    dispatcher.bus_event(BusEvent::MasterWriteDone);
    dispatcher.poll();
    let response = app.receive().unwrap();
    assert!(response.stat.resp());
    assert_eq!(response.orig, 0x42);
}

#[test]
fn unacknowledged_transfer_comes_back_as_error_response() {
    let (dispatcher, _, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();
    app.lock();

    let mut frame = Frame::request(0x42, LOCAL_ADDR, Command::State);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    dispatcher.bus_event(BusEvent::NoSlaveAck);
    dispatcher.poll();

    let response = app.receive().unwrap();
    assert!(response.stat.resp());
    assert!(response.stat.error());
    assert!(!response.stat.time_out());
    assert_eq!(response.t_id, frame.t_id);

    // the in-flight slot is free again
    assert!(app.transmit(&mut frame).is_ok());
}

#[test]
fn expired_deadline_recovers_the_transfer_slot() {
    let (dispatcher, bus, clock) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();
    app.lock();
    bus.take_ops();

    let mut frame = Frame::request(0x42, LOCAL_ADDR, Command::State);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();
    assert_eq!(bus.take_transfers().len(), 1);

    // no hardware event ever comes back
    clock.advance(past_deadline());
    dispatcher.poll();

    let response = app.receive().unwrap();
    assert!(response.stat.error());
    assert!(response.stat.time_out());
    assert_eq!(response.t_id, frame.t_id);

    // and a new transfer can start
    let mut next = Frame::request(0x43, LOCAL_ADDR, Command::State);
    app.transmit(&mut next).unwrap();
    dispatcher.poll();
    assert_eq!(bus.take_transfers().len(), 1);
}

#[test]
fn refused_start_is_retried_next_tick() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, 0).unwrap();
    app.lock();
    bus.take_ops();

    bus.refuse_start(true);
    let mut frame = Frame::request(0x42, LOCAL_ADDR, Command::State);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();
    assert!(bus.take_transfers().is_empty());

    bus.refuse_start(false);
    dispatcher.poll();
    assert_eq!(bus.take_transfers().len(), 1);
}

#[test]
fn full_channel_queue_drops_silently() {
    let (dispatcher, _, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();

    let frame = Frame::request(LOCAL_ADDR, 0x42, Command::State);
    for _ in 0 .. CHANNEL_DEPTH + 2 {
        dispatcher.bus_event(BusEvent::SlaveRxEnd(&frame.body()));
        dispatcher.poll();
    }

    let mut received = 0;
    while app.receive().is_some() {
        received += 1;
    }
    assert_eq!(received, CHANNEL_DEPTH);
}

#[test]
fn wrong_sized_reception_is_ignored() {
    let (dispatcher, _, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();

    let body = Frame::request(LOCAL_ADDR, 0x42, Command::State).body();
    dispatcher.bus_event(BusEvent::SlaveRxEnd(&body[.. body.len() - 1]));
    dispatcher.poll();
    assert!(app.receive().is_none());

    dispatcher.bus_event(BusEvent::SlaveRxEnd(&body));
    dispatcher.poll();
    assert!(app.receive().is_some());
}

#[test]
fn general_call_reception_is_delivered_like_any_frame() {
    let (dispatcher, _, _) = node();
    let app = dispatcher.register(0, Command::List.mask()).unwrap();

    let body = Frame::request(0x00, 0x0b, Command::List).args([1, 2]).body();
    dispatcher.bus_event(BusEvent::GeneralCallEnd(&body));
    dispatcher.poll();

    let received = app.receive().unwrap();
    assert_eq!(received.cmde, Command::List);
    assert_eq!(received.orig, 0x0b);
}

#[test]
fn delivery_follows_the_channel_masks() {
    let (dispatcher, _, _) = node();
    let listing = dispatcher.register(0, Command::List.mask()).unwrap();
    let lining = dispatcher.register(1, Command::Line.mask()).unwrap();
    let both = dispatcher.register(2, Command::List.mask() | Command::Line.mask()).unwrap();

    let body = Frame::request(LOCAL_ADDR, 0x42, Command::List).body();
    dispatcher.bus_event(BusEvent::SlaveRxEnd(&body));
    dispatcher.poll();

    assert!(listing.receive().is_some());
    assert!(lining.receive().is_none());
    assert!(both.receive().is_some());
}

#[test]
fn routed_destination_fans_out_in_table_order() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, 0).unwrap();
    app.lock();
    dispatcher.route_add(0x30, 0x40).unwrap();
    dispatcher.route_add(0x30, 0x41).unwrap();
    bus.take_ops();

    let mut frame = Frame::request(0x30, LOCAL_ADDR, Command::State);
    app.transmit(&mut frame).unwrap();

    // one transfer at a time: each completion lets the next destination go
    dispatcher.poll();
    let first = bus.take_transfers();
    dispatcher.bus_event(BusEvent::MasterWriteDone);
    dispatcher.poll();
    let second = bus.take_transfers();

    match (&first[..], &second[..]) {
        ([BusOp::Write {dest: first, ..}], [BusOp::Write {dest: second, ..}]) => {
            assert_eq!((*first, *second), (0x40, 0x41));
        }
        other => panic!("unexpected transfers: {:?}", other),
    }
}

#[test]
fn route_to_the_local_alias_short_circuits_the_bus() {
    let (dispatcher, bus, _) = node();
    let app = dispatcher.register(0, Command::State.mask()).unwrap();
    app.lock();
    dispatcher.route_add(0x30, LOCAL_ADDR).unwrap();
    bus.take_ops();

    let mut frame = Frame::request(0x30, LOCAL_ADDR, Command::State);
    app.transmit(&mut frame).unwrap();
    dispatcher.poll();

    assert!(app.receive().is_some());
    assert!(bus.take_transfers().is_empty());
}

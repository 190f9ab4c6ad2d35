/*!
    the frame dispatcher, sole owner of the physical bus.

    Applications register prioritized channels and exchange [Frame]s through
    them; the dispatcher multiplexes their transmissions onto one in-flight
    bus transfer at a time, routes destinations through the routing table,
    loops local and broadcast frames back to the node's own channels, and
    recovers wedged transfers with a deadline watchdog.

    Every channel method is non-blocking: [Interface::transmit] answers
    [TxError::Busy] instead of waiting and the caller retries on the next
    tick of its own poll loop. [Dispatcher::poll] must run on every tick of
    the node scheduler.
*/

use core::time::Duration;

use heapless::Deque;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    bus::{BusDriver, BusEvent, Clock},
    frame::{Command, Frame, FRAME_SIZE, NB_ARGS},
    mutex::BusyMutex,
    routing::{MAX_ROUTES, RouteError, RoutingTable},
    };


/// frame sent to every node at once
pub const BROADCAST_ADDR: u8 = 0x00;
/// alias always designating the local node, whatever its bus address
pub const LOCAL_ADDR: u8 = 0x01;
/// first assignable bus address
pub const FIRST_ADDR: u8 = 0x02;
/// last assignable bus address
pub const LAST_ADDR: u8 = 0x7f;

/// number of application channels
pub const CHANNEL_COUNT: usize = 10;
/// frames a channel can hold before inbound delivery drops
pub const CHANNEL_DEPTH: usize = 4;

const INBOUND_DEPTH: usize = 4;
/// a bus byte is 8 data bits plus the acknowledge bit
const BITS_PER_BYTE: u64 = 9;


/// the frame cannot be accepted now, retry on the next tick
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    #[error("channel unlocked, preempted by a higher priority, or a frame is already pending")]
    Busy,
}


struct Channel {
    /// commands this channel wants to receive
    mask: u64,
    /// frames received for this channel, drained by the owning application
    queue: Deque<Frame, CHANNEL_DEPTH>,
}

/// the single in-flight bus transfer
#[derive(Clone, Copy)]
enum Transfer {
    Idle,
    Waiting {
        frame: Frame,
        deadline: Duration,
    },
}

struct Inner<B> {
    driver: B,
    channels: [Option<Channel>; CHANNEL_COUNT],
    /// lock bitfield, bit n set while channel n holds its transmission lock
    locks: u16,
    /// own bus address, [LOCAL_ADDR] until addressing assigns one
    self_addr: u8,
    /// last assigned transaction identifier
    t_id: u8,
    /// application outbound slot, depth 1 by contract
    pending: Option<Frame>,
    /// frames routed to the bus, waiting for their transfer
    bus_queue: Deque<Frame, MAX_ROUTES>,
    /// frames going to local delivery
    inbound: Deque<Frame, INBOUND_DEPTH>,
    routes: RoutingTable,
    transfer: Transfer,
}


/**
    dispatcher for one node, generic over the bus hardware and the time source.

    One instance per node; applications keep [Interface] handles into it.
*/
pub struct Dispatcher<B: BusDriver, C: Clock> {
    inner: BusyMutex<Inner<B>>,
    clock: C,
    /// bus time of one byte, derived from the baud rate
    byte_time: Duration,
}

impl<B: BusDriver, C: Clock> Dispatcher<B, C> {
    /// initialize over the given driver, answering [LOCAL_ADDR] until addressing completes
    pub fn new(mut driver: B, clock: C, rate: u32) -> Self {
        driver.set_self_address(LOCAL_ADDR);
        Self {
            inner: BusyMutex::new(Inner {
                driver,
                channels: [const {None}; CHANNEL_COUNT],
                locks: 0,
                self_addr: LOCAL_ADDR,
                t_id: 0,
                pending: None,
                bus_queue: Deque::new(),
                inbound: Deque::new(),
                routes: RoutingTable::new(),
                transfer: Transfer::Idle,
            }),
            clock,
            byte_time: Duration::from_micros(BITS_PER_BYTE * 1_000_000 / u64::from(rate)),
        }
    }

    /**
        reserve a channel, the lowest free index at or above `requested`.

        `mask` selects the commands delivered to the channel, one bit per
        [Command] code. `None` when every candidate channel is taken: the
        caller then has no way to exchange frames.
    */
    pub fn register(&self, requested: usize, mask: u64) -> Option<Interface<'_, B, C>> {
        if requested >= CHANNEL_COUNT
            {return None}
        let mut inner = self.inner.blocking_lock();
        let index = (requested .. CHANNEL_COUNT).find(|&i| inner.channels[i].is_none())?;
        inner.channels[index] = Some(Channel {mask, queue: Deque::new()});
        debug!("channel {} registered, mask {:#018x}", index, mask);
        Some(Interface {dispatcher: self, index})
    }

    /**
        drive the dispatcher, to be called on every scheduler tick.

        Chains the watchdog, the application outbound intake, one inbound
        delivery and the next bus transmission; each does a bounded amount of
        work and none ever blocks.
    */
    pub fn poll(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.blocking_lock();

        // watchdog: a wedged transfer is recovered by faking the hardware
        // fault event through the regular completion path. The state lock is
        // already held here so a genuine completion cannot interleave with
        // the synthetic one.
        if let Transfer::Waiting {deadline, ..} = inner.transfer {
            if now > deadline {
                warn!("bus transfer deadline expired");
                inner.handle_event(BusEvent::Fault);
            }
        }

        inner.intake();
        inner.deliver();
        inner.transmit_next(now, self.byte_time);
    }

    /**
        completion entry point for the bus driver.

        May be invoked from a context preempting [poll](Self::poll); the
        internal state lock serializes both.
    */
    pub fn bus_event(&self, event: BusEvent) {
        self.inner.blocking_lock().handle_event(event);
    }

    /// adopt `addr` as this node's bus address
    pub fn set_self_address(&self, addr: u8) {
        let mut inner = self.inner.blocking_lock();
        inner.self_addr = addr;
        inner.driver.set_self_address(addr);
    }

    /// current own bus address
    pub fn self_address(&self) -> u8 {
        self.inner.blocking_lock().self_addr
    }

    /// also receive frames addressed to every node at once
    pub fn enable_general_call(&self, enable: bool) {
        self.inner.blocking_lock().driver.enable_general_call(enable);
    }

    /// the dispatcher's time source, shared with the applications needing one
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// append a routing pair, applied to every subsequent transmission
    pub fn route_add(&self, virtual_addr: u8, routed_addr: u8) -> Result<(), RouteError> {
        self.inner.blocking_lock().routes.add(virtual_addr, routed_addr)
    }

    /// remove the first routing pair matching exactly
    pub fn route_delete(&self, virtual_addr: u8, routed_addr: u8) -> Result<(), RouteError> {
        self.inner.blocking_lock().routes.delete(virtual_addr, routed_addr)
    }

    /// number of routing pairs set
    pub fn route_count(&self) -> usize {
        self.inner.blocking_lock().routes.count()
    }

    /// routing pair at `index`, in insertion order
    pub fn route_line(&self, index: usize) -> Option<(u8, u8)> {
        self.inner.blocking_lock().routes.line(index)
    }
}


/**
    an application's handle on its dispatcher channel.

    The channel index is its priority: 0 is the highest. A channel transmits
    only while it holds its own lock and no lower index holds one.
*/
pub struct Interface<'d, B: BusDriver, C: Clock> {
    dispatcher: &'d Dispatcher<B, C>,
    index: usize,
}

impl<'d, B: BusDriver, C: Clock> Interface<'d, B, C> {
    /// assigned channel index
    pub fn index(&self) -> usize {
        self.index
    }

    /// the dispatcher this channel belongs to
    pub fn dispatcher(&self) -> &'d Dispatcher<B, C> {
        self.dispatcher
    }

    /// take the channel transmission lock, blocking lower priorities
    pub fn lock(&self) {
        self.dispatcher.inner.blocking_lock().locks |= 1 << self.index;
    }

    /// release the channel transmission lock
    pub fn unlock(&self) {
        self.dispatcher.inner.blocking_lock().locks &= !(1 << self.index);
    }

    /**
        submit a frame for sending.

        On success a non-response frame receives the next transaction
        identifier, written back into `frame` so the caller can match the
        response. [TxError::Busy] is the normal contention answer and simply
        means retry on the next tick.
    */
    pub fn transmit(&self, frame: &mut Frame) -> Result<(), TxError> {
        let mut inner = self.dispatcher.inner.blocking_lock();
        // locked by a channel of higher priority
        if inner.locks & ((1 << self.index) - 1) != 0
            {return Err(TxError::Busy)}
        // own lock not taken
        if inner.locks & (1 << self.index) == 0
            {return Err(TxError::Busy)}
        if inner.pending.is_some()
            {return Err(TxError::Busy)}

        if !frame.stat.resp() {
            inner.t_id = inner.t_id.wrapping_add(1);
            frame.t_id = inner.t_id;
        }
        inner.pending = Some(*frame);
        Ok(())
    }

    /// next frame received on this channel, if any
    pub fn receive(&self) -> Option<Frame> {
        let mut inner = self.dispatcher.inner.blocking_lock();
        inner.channels[self.index].as_mut()?.queue.pop_front()
    }

    /// whether frames are waiting on this channel
    pub fn pending(&self) -> bool {
        let inner = self.dispatcher.inner.blocking_lock();
        inner.channels[self.index].as_ref()
            .is_some_and(|channel| !channel.queue.is_empty())
    }
}


impl<B: BusDriver> Inner<B> {
    /// route the application outbound frame and dispatch the destinations
    fn intake(&mut self) {
        // wait for the previous fan-out to fully drain so routing can never
        // overflow the bus queue
        if !self.bus_queue.is_empty()
            {return}
        let Some(frame) = self.pending.take()
            else {return};

        let mut routed = [0u8; MAX_ROUTES];
        let count = match self.routes.lookup(frame.dest, &mut routed) {
            // no route set: the destination is already physical
            0 => {
                routed[0] = frame.dest;
                1
            }
            n => n,
        };

        for &dest in &routed[.. count] {
            let mut copy = frame;
            copy.dest = dest;
            if dest == BROADCAST_ADDR {
                // broadcasts reach the local node and the bus
                self.push_inbound(copy);
                copy.orig = self.self_addr;
                self.push_bus(copy);
            }
            else if dest == LOCAL_ADDR || dest == self.self_addr {
                self.push_inbound(copy);
            }
            else {
                copy.orig = self.self_addr;
                self.push_bus(copy);
            }
        }
    }

    /// hand one inbound frame to every channel whose filter accepts it
    fn deliver(&mut self) {
        let Some(frame) = self.inbound.pop_front()
            else {return};
        let bit = frame.cmde.mask();
        for channel in self.channels.iter_mut().flatten() {
            if channel.mask & bit != 0 {
                // a full channel silently drops, that is the back-pressure
                if channel.queue.push_back(frame).is_err() {
                    trace!("channel queue full, frame dropped");
                }
            }
        }
    }

    /// start the next bus transfer if none is in flight
    fn transmit_next(&mut self, now: Duration, byte_time: Duration) {
        if !matches!(self.transfer, Transfer::Idle)
            {return}
        let Some(frame) = self.bus_queue.pop_front()
            else {return};

        let started = match frame.cmde {
            // raw passthrough: the arguments carry the remote payload
            Command::TwiRead =>
                self.driver.start_master_read(frame.dest, usize::from(frame.argv[0])),
            Command::TwiWrite => {
                let len = usize::from(frame.argv[0]).min(NB_ARGS - 1);
                self.driver.start_master_write(frame.dest, &frame.argv[1 .. 1 + len])
            }
            // every other command transfers the full frame body
            _ =>
                self.driver.start_master_write(frame.dest, &frame.body()),
        };

        match started {
            Ok(()) => {
                trace!("transfer started to {:#04x}", frame.dest);
                self.transfer = Transfer::Waiting {
                    frame,
                    deadline: now + byte_time * FRAME_SIZE as u32,
                };
            }
            Err(_) => {
                // no deadline pending, the frame goes first on the next tick
                debug!("transfer refused by hardware, will retry");
                let _ = self.bus_queue.push_front(frame);
            }
        }
    }

    /// single completion path shared by hardware events and the watchdog
    fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::NoSlaveAck => {
                // nobody answered: report it to the original requester
                if let Transfer::Waiting {frame, ..} = self.transfer {
                    let mut resp = frame;
                    resp.dest = self.self_addr;
                    resp.stat.set_resp(true);
                    resp.stat.set_error(true);
                    self.push_inbound(resp);
                }
                self.transfer = Transfer::Idle;
                self.driver.stop();
            }

            BusEvent::MasterWriteDone => {
                if let Transfer::Waiting {frame, ..} = self.transfer {
                    if frame.cmde == Command::TwiWrite {
                        let mut resp = frame;
                        resp.dest = LOCAL_ADDR;
                        resp.orig = frame.dest;
                        resp.stat.set_resp(true);
                        self.push_inbound(resp);
                    }
                    // other commands were delivered on the remote side,
                    // completion only frees the slot
                }
                self.transfer = Transfer::Idle;
                self.driver.stop();
            }

            BusEvent::MasterReadDone(data) => {
                if let Transfer::Waiting {frame, ..} = self.transfer {
                    if frame.cmde == Command::TwiRead {
                        let mut resp = frame;
                        resp.dest = LOCAL_ADDR;
                        resp.orig = frame.dest;
                        resp.stat.set_resp(true);
                        let len = data.len().min(NB_ARGS - 1);
                        resp.argv[1 .. 1 + len].copy_from_slice(&data[.. len]);
                        self.push_inbound(resp);
                    }
                }
                self.transfer = Transfer::Idle;
                self.driver.stop();
            }

            BusEvent::SlaveRxBegin | BusEvent::GeneralCallBegin => {
                trace!("slave reception starting");
            }

            BusEvent::SlaveRxEnd(body) | BusEvent::GeneralCallEnd(body) => {
                // anything that is not exactly a frame body is ignored
                match Frame::from_body(self.self_addr, body) {
                    Some(frame) => self.push_inbound(frame),
                    None => debug!("received {} bytes, not a frame, dropped", body.len()),
                }
                self.driver.stop();
            }

            BusEvent::SlaveTxBegin => {
                // this node never answers as a read target
            }

            BusEvent::SlaveTxEnd => {
                self.driver.stop();
            }

            BusEvent::Fault => {
                // hardware error or expired deadline: report and free the slot
                if let Transfer::Waiting {frame, ..} = self.transfer {
                    let mut resp = frame;
                    resp.dest = self.self_addr;
                    resp.stat.set_resp(true);
                    resp.stat.set_error(true);
                    resp.stat.set_time_out(true);
                    self.push_inbound(resp);
                }
                self.transfer = Transfer::Idle;
                self.driver.stop();
            }
        }
    }

    fn push_inbound(&mut self, frame: Frame) {
        if self.inbound.push_back(frame).is_err() {
            trace!("inbound queue full, frame dropped");
        }
    }

    fn push_bus(&mut self, frame: Frame) {
        if self.bus_queue.push_back(frame).is_err() {
            trace!("bus queue full, frame dropped");
        }
    }
}

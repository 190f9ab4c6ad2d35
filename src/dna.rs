/*!
    dynamic node addressing, the DHCP-like negotiation bootstrapping the bus.

    Every node first scans a small reserved address range for a free bus
    address. The bus controller then probes the whole bus for silent basic
    slaves and serves registrations; every other node registers with the
    controller and keeps a replicated copy of the resulting node table,
    updated from the controller's broadcasts.

    The whole protocol rides on a regular dispatcher channel; [Dna::run] is a
    non-blocking state machine step to be called on every scheduler tick.
*/

use core::time::Duration;

use log::{debug, info, warn};

use crate::{
    bus::{BusDriver, Clock},
    dispatcher::{BROADCAST_ADDR, Dispatcher, FIRST_ADDR, Interface, LAST_ADDR, LOCAL_ADDR},
    frame::{Command, Frame},
    };


/// node table capacity, self and controller slots included
pub const NODE_TABLE_SIZE: usize = 10;
/// table slot aliasing the local node
pub const SELF_SLOT: usize = 0;
/// table slot of the bus controller
pub const CONTROLLER_SLOT: usize = 1;
/// first table slot of registered slaves
const FIRST_IS_SLOT: usize = 2;

/// channel used by the addressing protocol
pub const DNA_CHANNEL: usize = 2;

/// reserved address range scanned for a free own address
pub const SCAN_ADDR_MIN: u8 = 0x08;
pub const SCAN_ADDR_MAX: u8 = 0x0f;
/// bus multiplexer device, never probed
const MUX_ADDR: u8 = 0x70;

const REGISTER_TIMEOUT: Duration = Duration::from_millis(10);
const REGISTER_ATTEMPTS: u8 = 5;
/// reconfiguration argument forcing the no-bus (autonomous) mode
const BUS_MODE_NONE: u8 = 0x02;


/// role and kind of a node, as carried in registration frames
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    #[default]
    Unknown = 0,
    /// bus controller, arbitrates addressing and owns the node table
    Controller = 1,
    /// basic slave, found by probing, never speaks on its own
    Basic = 2,
    Timer = 3,
    Payload = 4,
    Storage = 5,
}

impl From<NodeKind> for u8 {
    fn from(kind: NodeKind) -> u8 {
        kind as u8
    }
}
impl From<u8> for NodeKind {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Controller,
            2 => Self::Basic,
            3 => Self::Timer,
            4 => Self::Payload,
            5 => Self::Storage,
            _ => Self::Unknown,
        }
    }
}


#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeEntry {
    pub kind: NodeKind,
    pub addr: u8,
}

/**
    the replicated node table.

    Slot 0 aliases the local node and slot 1 the bus controller; registered
    slaves fill the slots above 1 in registration order while basic slaves
    fill the table from its end downward, so `2 + nb_is + nb_bs` can never
    exceed the table size. Slot indices are wire-visible: the controller's
    LINE broadcasts carry them verbatim.
*/
pub struct NodeTable {
    entries: [NodeEntry; NODE_TABLE_SIZE],
    nb_is: u8,
    nb_bs: u8,
}

impl NodeTable {
    fn new(kind: NodeKind) -> Self {
        let mut entries = [NodeEntry::default(); NODE_TABLE_SIZE];
        entries[SELF_SLOT].kind = kind;
        Self {entries, nb_is: 0, nb_bs: 0}
    }

    pub fn entries(&self) -> &[NodeEntry; NODE_TABLE_SIZE] {
        &self.entries
    }

    /// (registered slave count, basic slave count)
    pub fn counts(&self) -> (u8, u8) {
        (self.nb_is, self.nb_bs)
    }

    pub fn self_entry(&self) -> NodeEntry {
        self.entries[SELF_SLOT]
    }

    pub fn controller(&self) -> NodeEntry {
        self.entries[CONTROLLER_SLOT]
    }

    fn adopt_self(&mut self, addr: u8) {
        self.entries[SELF_SLOT].addr = addr;
    }

    fn set_controller(&mut self, entry: NodeEntry) {
        self.entries[CONTROLLER_SLOT] = entry;
    }

    /// whether one more registered slave fits
    fn is_room(&self) -> bool {
        FIRST_IS_SLOT + usize::from(self.nb_is) + 1 + usize::from(self.nb_bs) <= NODE_TABLE_SIZE
    }

    fn register_is(&mut self, addr: u8, kind: NodeKind) {
        self.nb_is += 1;
        self.entries[CONTROLLER_SLOT + usize::from(self.nb_is)] = NodeEntry {kind, addr};
    }

    /// count a found basic slave, recording it while the table has room
    fn record_bs(&mut self, addr: u8) {
        self.nb_bs += 1;
        if FIRST_IS_SLOT + usize::from(self.nb_is) + usize::from(self.nb_bs) <= NODE_TABLE_SIZE {
            self.entries[NODE_TABLE_SIZE - usize::from(self.nb_bs)] =
                NodeEntry {kind: NodeKind::Basic, addr};
        }
    }

    fn set_counts(&mut self, nb_is: u8, nb_bs: u8) {
        self.nb_is = nb_is;
        self.nb_bs = nb_bs;
    }

    fn apply_line(&mut self, index: usize, kind: NodeKind, addr: u8) {
        if index < NODE_TABLE_SIZE {
            self.entries[index] = NodeEntry {kind, addr};
        }
    }
}


/// one address probe: send a read request, then wait for its response
#[derive(Copy, Clone, Debug)]
struct Probe {
    candidate: u8,
    /// transaction id of the probe in flight
    awaiting: Option<u8>,
}

impl Probe {
    fn at(candidate: u8) -> Self {
        Self {candidate, awaiting: None}
    }
}

/// registration progress of a non-controller node
#[derive(Copy, Clone, Debug, Default)]
struct Registration {
    attempts: u8,
    deadline: Option<Duration>,
    giving_up: bool,
}

/// controller steady-state bookkeeping
#[derive(Copy, Clone, Debug, Default)]
struct Service {
    /// response waiting to go out
    reply: Option<Frame>,
    /// next table slot to broadcast, table summary once past the last slot
    rebroadcast: Option<usize>,
}

enum State {
    /// scanning the reserved range for a free own address
    ScanFree(Probe),
    /// controller only: probing the whole bus for basic slaves
    ScanBus(Probe),
    /// controller steady state
    Controller(Service),
    /// non-controller: registering with the controller
    Registering(Registration),
    /// non-controller steady state, replicating the table
    Passive,
    /// address range exhausted, addressing is stuck for good
    Parked,
}


/// the dynamic node addressing protocol of one node
pub struct Dna<'d, B: BusDriver, C: Clock> {
    interf: Interface<'d, B, C>,
    table: NodeTable,
    state: State,
}

impl<'d, B: BusDriver, C: Clock> Dna<'d, B, C> {
    /**
        register the protocol on its channel and start the free-address scan.

        The channel is locked from here until the node is bootstrapped
        (scans complete for a controller, registration over for the others),
        keeping lower-priority traffic off the bus meanwhile.
    */
    pub fn new(dispatcher: &'d Dispatcher<B, C>, kind: NodeKind) -> Option<Self> {
        let mask = Command::Register.mask()
            | Command::List.mask()
            | Command::Line.mask()
            | Command::TwiRead.mask()
            | Command::TwiWrite.mask();
        let interf = dispatcher.register(DNA_CHANNEL, mask)?;
        interf.lock();
        Some(Self {
            interf,
            table: NodeTable::new(kind),
            state: State::ScanFree(Probe::at(SCAN_ADDR_MIN)),
        })
    }

    /// the replicated node table
    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// the node table with its slave counts
    pub fn list(&self) -> (&[NodeEntry; NODE_TABLE_SIZE], u8, u8) {
        (self.table.entries(), self.table.nb_is, self.table.nb_bs)
    }

    /// one protocol step, to be called on every scheduler tick
    pub fn run(&mut self) {
        let state = core::mem::replace(&mut self.state, State::Parked);
        self.state = match state {
            State::ScanFree(probe) => self.scan_free(probe),
            State::ScanBus(probe) => self.scan_bus(probe),
            State::Controller(service) => self.controller(service),
            State::Registering(registration) => self.registering(registration),
            State::Passive => self.passive(),
            State::Parked => State::Parked,
        };
    }

    /// probe the reserved range until an address does not answer
    fn scan_free(&mut self, mut probe: Probe) -> State {
        let Some(t_id) = probe.awaiting else {
            self.send_probe(&mut probe);
            return State::ScanFree(probe);
        };
        while let Some(frame) = self.interf.receive() {
            if !probe_response(&frame, t_id)
                {continue}
            if frame.stat.error() {
                // nobody answered: the address is free, adopt it
                self.table.adopt_self(probe.candidate);
                self.interf.dispatcher().set_self_address(probe.candidate);
                info!("own address acquired: {:#04x}", probe.candidate);
                return if self.table.self_entry().kind == NodeKind::Controller {
                    State::ScanBus(Probe::at(FIRST_ADDR))
                } else {
                    State::Registering(Registration::default())
                };
            }
            // taken, try the next one
            probe.awaiting = None;
            probe.candidate += 1;
            if probe.candidate > SCAN_ADDR_MAX {
                // a genuine dead end, nothing to do but wait for a reset
                warn!("reserved address range exhausted, addressing parked");
                return State::Parked;
            }
            break;
        }
        State::ScanFree(probe)
    }

    /// probe the whole bus, recording every address that answers
    fn scan_bus(&mut self, mut probe: Probe) -> State {
        let Some(t_id) = probe.awaiting else {
            self.send_probe(&mut probe);
            return State::ScanBus(probe);
        };
        while let Some(frame) = self.interf.receive() {
            if !probe_response(&frame, t_id)
                {continue}
            if !frame.stat.error() {
                debug!("basic slave found at {:#04x}", probe.candidate);
                self.table.record_bs(probe.candidate);
            }
            probe.awaiting = None;
            match next_scan_addr(probe.candidate) {
                Some(next) => probe.candidate = next,
                None => {
                    // scan done: open up and start serving registrations
                    self.interf.unlock();
                    let addr = self.table.self_entry().addr;
                    self.table.set_controller(NodeEntry {kind: NodeKind::Controller, addr});
                    self.interf.dispatcher().enable_general_call(true);
                    info!("bus scan complete, {} basic slaves", self.table.counts().1);
                    return State::Controller(Service::default());
                }
            }
            break;
        }
        State::ScanBus(probe)
    }

    fn send_probe(&mut self, probe: &mut Probe) {
        // zero-length read: the acknowledge alone tells whether anyone is there
        let mut frame = Frame::request(probe.candidate, 0, Command::TwiRead);
        if self.interf.transmit(&mut frame).is_ok() {
            probe.awaiting = Some(frame.t_id);
        }
    }

    /// broadcast registrations until the controller answers, then give up
    fn registering(&mut self, mut registration: Registration) -> State {
        if registration.giving_up {
            // one-shot: ask the local node to run without the bus
            let mut frame = Frame::request(LOCAL_ADDR, LOCAL_ADDR, Command::ReconfMode)
                .args([0x00, BUS_MODE_NONE]);
            if self.interf.transmit(&mut frame).is_ok() {
                self.interf.unlock();
                return State::Passive;
            }
            return State::Registering(registration);
        }

        let now = self.interf.dispatcher().now();
        let Some(deadline) = registration.deadline else {
            let own = self.table.self_entry();
            let mut frame = Frame::request(BROADCAST_ADDR, own.addr, Command::Register)
                .args([own.addr, u8::from(own.kind)]);
            if self.interf.transmit(&mut frame).is_ok() {
                debug!("registration attempt {}", registration.attempts + 1);
                registration.deadline = Some(now + REGISTER_TIMEOUT);
            }
            return State::Registering(registration);
        };

        while let Some(frame) = self.interf.receive() {
            // everything but a clean response is discarded, a rejected
            // registration runs into the timeout like an unanswered one
            if frame.cmde == Command::Register && frame.stat.resp() && !frame.stat.error() {
                self.table.set_controller(NodeEntry {kind: NodeKind::Controller, addr: frame.orig});
                self.interf.dispatcher().enable_general_call(true);
                self.interf.unlock();
                info!("registered with controller {:#04x}", frame.orig);
                return State::Passive;
            }
        }
        if now >= deadline {
            registration.attempts += 1;
            registration.deadline = None;
            if registration.attempts >= REGISTER_ATTEMPTS {
                warn!("no controller answered {} registrations, going autonomous",
                    registration.attempts);
                registration.giving_up = true;
            }
        }
        State::Registering(registration)
    }

    /// controller steady state: serve requests and rebroadcast the table
    fn controller(&mut self, mut service: Service) -> State {
        // a pending reply goes out before anything else
        if let Some(mut frame) = service.reply {
            if self.interf.transmit(&mut frame).is_ok() {
                service.reply = None;
                if service.rebroadcast.is_none() {
                    self.interf.unlock();
                }
            }
            return State::Controller(service);
        }

        // fold in the next request, it may restart the redistribution
        if let Some(frame) = self.interf.receive() {
            self.serve(&mut service, frame);
            return State::Controller(service);
        }

        // one table line broadcast per tick
        if let Some(index) = service.rebroadcast {
            let addr = self.table.self_entry().addr;
            let mut frame = if index < NODE_TABLE_SIZE {
                let entry = self.table.entries()[index];
                Frame::request(BROADCAST_ADDR, addr, Command::Line)
                    .args([index as u8, u8::from(entry.kind), entry.addr])
            } else {
                let (nb_is, nb_bs) = self.table.counts();
                Frame::request(BROADCAST_ADDR, addr, Command::List)
                    .args([nb_is, nb_bs])
            };
            if self.interf.transmit(&mut frame).is_ok() {
                if index < NODE_TABLE_SIZE {
                    service.rebroadcast = Some(index + 1);
                } else {
                    // summary sent, redistribution over
                    service.rebroadcast = None;
                    self.interf.unlock();
                }
            }
        }
        State::Controller(service)
    }

    fn serve(&mut self, service: &mut Service, frame: Frame) {
        let own = self.table.self_entry();
        // own broadcasts loop back here, and responses are not requests
        if frame.stat.resp() || frame.orig == own.addr
            {return}

        let mut resp = Frame::request(frame.orig, own.addr, frame.cmde);
        resp.t_id = frame.t_id;
        resp.stat.set_resp(true);
        resp.stat.set_eth(frame.stat.eth());
        resp.stat.set_serial(frame.stat.serial());

        let reply = match frame.cmde {
            Command::Register => {
                if self.table.is_room() {
                    self.table.register_is(frame.argv[0], NodeKind::from(frame.argv[1]));
                    info!("node {:#04x} registered", frame.argv[0]);
                    // reannounce the table from the first slave line
                    service.rebroadcast = Some(FIRST_IS_SLOT);
                } else {
                    debug!("registration refused, node table full");
                    resp.stat.set_error(true);
                }
                resp
            }
            Command::List => {
                let (nb_is, nb_bs) = self.table.counts();
                resp.args([nb_is, nb_bs])
            }
            Command::Line => {
                let index = usize::from(frame.argv[0]);
                if index < NODE_TABLE_SIZE {
                    let entry = self.table.entries()[index];
                    resp.args([frame.argv[0], u8::from(entry.kind), entry.addr])
                } else {
                    resp.stat.set_error(true);
                    resp
                }
            }
            // probe responses and passthrough frames are not served
            _ => return,
        };

        self.interf.lock();
        service.reply = Some(reply);
    }

    /// passive steady state: replicate the controller's broadcasts
    fn passive(&mut self) -> State {
        while let Some(frame) = self.interf.receive() {
            if frame.stat.resp()
                {continue}
            match frame.cmde {
                Command::List => self.table.set_counts(frame.argv[0], frame.argv[1]),
                Command::Line => self.table.apply_line(
                    usize::from(frame.argv[0]),
                    NodeKind::from(frame.argv[1]),
                    frame.argv[2],
                ),
                _ => {}
            }
        }
        State::Passive
    }
}


/// whether `frame` answers the probe sent with transaction id `t_id`
fn probe_response(frame: &Frame, t_id: u8) -> bool {
    frame.cmde == Command::TwiRead && frame.stat.resp() && frame.t_id == t_id
}

/// next address of the full bus scan, skipping the reserved range and the multiplexer
fn next_scan_addr(addr: u8) -> Option<u8> {
    let mut next = addr + 1;
    if next == SCAN_ADDR_MIN {
        next = SCAN_ADDR_MAX + 1;
    }
    if next == MUX_ADDR {
        next += 1;
    }
    (next <= LAST_ADDR).then_some(next)
}

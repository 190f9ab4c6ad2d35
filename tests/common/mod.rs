//! simulated bus hardware and virtual time driving the dispatcher in tests,
//! the same way the original hardware is stubbed when testing on a host

#![allow(dead_code)]

use core::time::Duration;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use twinet::bus::{BusDriver, BusFault, Clock};
use twinet::dispatcher::Dispatcher;


/// every call the dispatcher makes into the bus hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Write {dest: u8, data: Vec<u8>},
    Read {dest: u8, len: usize},
    Stop,
    SelfAddress(u8),
    GeneralCall(bool),
}

/// records the dispatcher's driver calls; completions are injected by the test
#[derive(Clone, Default)]
pub struct SimBus {
    ops: Rc<RefCell<Vec<BusOp>>>,
    refuse: Rc<Cell<bool>>,
}

impl SimBus {
    /// drain every recorded operation
    pub fn take_ops(&self) -> Vec<BusOp> {
        self.ops.borrow_mut().drain(..).collect()
    }

    /// drain the recorded operations, keeping only started transfers
    pub fn take_transfers(&self) -> Vec<BusOp> {
        self.take_ops().into_iter()
            .filter(|op| matches!(op, BusOp::Write {..} | BusOp::Read {..}))
            .collect()
    }

    /// make every start operation fail until further notice
    pub fn refuse_start(&self, refuse: bool) {
        self.refuse.set(refuse);
    }
}

impl BusDriver for SimBus {
    fn set_self_address(&mut self, addr: u8) {
        self.ops.borrow_mut().push(BusOp::SelfAddress(addr));
    }
    fn enable_general_call(&mut self, enable: bool) {
        self.ops.borrow_mut().push(BusOp::GeneralCall(enable));
    }
    fn start_master_write(&mut self, dest: u8, data: &[u8]) -> Result<(), BusFault> {
        if self.refuse.get()
            {return Err(BusFault)}
        self.ops.borrow_mut().push(BusOp::Write {dest, data: data.to_vec()});
        Ok(())
    }
    fn start_master_read(&mut self, dest: u8, len: usize) -> Result<(), BusFault> {
        if self.refuse.get()
            {return Err(BusFault)}
        self.ops.borrow_mut().push(BusOp::Read {dest, len});
        Ok(())
    }
    fn stop(&mut self) {
        self.ops.borrow_mut().push(BusOp::Stop);
    }
}


/// manually advanced monotonic clock
#[derive(Clone, Default)]
pub struct SimClock {
    micros: Rc<Cell<u64>>,
}

impl SimClock {
    pub fn advance(&self, duration: Duration) {
        self.micros.set(self.micros.get() + duration.as_micros() as u64);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.get())
    }
}


pub type SimDispatcher = Dispatcher<SimBus, SimClock>;

pub const RATE: u32 = 100_000;

/// a dispatcher over a fresh simulated bus, with handles kept by the test
pub fn node() -> (SimDispatcher, SimBus, SimClock) {
    let bus = SimBus::default();
    let clock = SimClock::default();
    let dispatcher = Dispatcher::new(bus.clone(), clock.clone(), RATE);
    (dispatcher, bus, clock)
}

/// comfortably more than a whole frame on the bus at [RATE]
pub fn past_deadline() -> Duration {
    Duration::from_millis(2)
}

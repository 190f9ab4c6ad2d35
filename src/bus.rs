/*!
    contracts of the two collaborators the networking layer is built on: the
    bus transfer hardware and a monotonic time source.

    The bus driver is asynchronous: every start operation returns immediately
    and the outcome is reported later as a [BusEvent] passed to
    [Dispatcher::bus_event](crate::dispatcher::Dispatcher::bus_event), usually
    straight from the bus interrupt. The dispatcher tolerates that context
    preempting its poll loop at any point.
*/

use core::time::Duration;
use thiserror::Error;


/// the hardware refused to start the transfer, it must be retried later
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bus transfer could not be started")]
pub struct BusFault;


/**
    completion events delivered by the bus driver.

    Received bytes are borrowed from the driver's own buffer and are only valid
    for the duration of the event call; the dispatcher copies what it keeps.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent<'a> {
    /// a master write fully transferred
    MasterWriteDone,
    /// a master read fully transferred, with the bytes read from the remote device
    MasterReadDone(&'a [u8]),
    /// no device acknowledged the addressed transfer
    NoSlaveAck,
    /// this node was selected as write target, reception is starting
    SlaveRxBegin,
    /// reception as a slave ended, with the received bytes
    SlaveRxEnd(&'a [u8]),
    /// this node was selected as read target
    SlaveTxBegin,
    /// transmission as a slave ended
    SlaveTxEnd,
    /// a general call (broadcast) reception is starting
    GeneralCallBegin,
    /// a general call reception ended, with the received bytes
    GeneralCallEnd(&'a [u8]),
    /// any other hardware error or time-out
    Fault,
}


/**
    two-wire master/slave bus transfer hardware.

    All operations return immediately; `start_*` outcomes arrive later as a
    [BusEvent]. At most one master transfer is in flight at a time, the
    dispatcher guarantees it never starts a second one before completion.
*/
pub trait BusDriver {
    /// set the address this node acknowledges as a slave
    fn set_self_address(&mut self, addr: u8);
    /// also acknowledge broadcast (general call) transfers
    fn enable_general_call(&mut self, enable: bool);
    /// start writing `data` to the device at `dest`
    fn start_master_write(&mut self, dest: u8, data: &[u8]) -> Result<(), BusFault>;
    /// start reading `len` bytes from the device at `dest`
    fn start_master_read(&mut self, dest: u8, len: usize) -> Result<(), BusFault>;
    /// release the bus after a completed or abandoned transfer
    fn stop(&mut self);
}


/// monotonic time source, only differences are meaningful
pub trait Clock {
    fn now(&self) -> Duration;
}

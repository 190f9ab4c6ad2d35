/*!
    routing table: a small indirection translating a virtual destination into
    the physical destinations a frame actually leaves for.

    The same virtual address may map to several routed addresses, which fans a
    single transmission out to all of them; pairs are kept in insertion order.
    The table itself is pure data, owned by the dispatcher; the [Routing]
    service manages it remotely through ordinary frames.
*/

use log::debug;
use thiserror::Error;

use crate::{
    bus::{BusDriver, Clock},
    dispatcher::{Dispatcher, Interface},
    frame::{Command, Frame},
    };


/// routing table capacity
pub const MAX_ROUTES: usize = 10;

/// channel used by the routing management service
pub const ROUTING_CHANNEL: usize = 9;


#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    #[error("routing table is full")]
    Full,
    #[error("no such routing pair")]
    NotFound,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Pair {
    virtual_addr: u8,
    routed_addr: u8,
}

/// insertion-ordered list of (virtual, routed) address pairs
#[derive(Default)]
pub struct RoutingTable {
    pairs: heapless::Vec<Pair, MAX_ROUTES>,
}

impl RoutingTable {
    pub const fn new() -> Self {
        Self {pairs: heapless::Vec::new()}
    }

    /// append a pair, duplicates allowed
    pub fn add(&mut self, virtual_addr: u8, routed_addr: u8) -> Result<(), RouteError> {
        self.pairs.push(Pair {virtual_addr, routed_addr})
            .map_err(|_| RouteError::Full)
    }

    /// remove the first pair matching exactly, preserving the order of the rest
    pub fn delete(&mut self, virtual_addr: u8, routed_addr: u8) -> Result<(), RouteError> {
        let index = self.pairs.iter()
            .position(|pair| pair.virtual_addr == virtual_addr && pair.routed_addr == routed_addr)
            .ok_or(RouteError::NotFound)?;
        self.pairs.remove(index);
        Ok(())
    }

    /**
        collect into `out` the routed addresses mapped to `addr`, in insertion
        order, and return how many were written.

        Truncates silently once `out` is full.
    */
    pub fn lookup(&self, addr: u8, out: &mut [u8]) -> usize {
        let mut count = 0;
        for pair in &self.pairs {
            if pair.virtual_addr == addr && count < out.len() {
                out[count] = pair.routed_addr;
                count += 1;
            }
        }
        count
    }

    /// number of pairs set
    pub fn count(&self) -> usize {
        self.pairs.len()
    }

    /// pair at `index` in insertion order, as (virtual, routed)
    pub fn line(&self, index: usize) -> Option<(u8, u8)> {
        self.pairs.get(index)
            .map(|pair| (pair.virtual_addr, pair.routed_addr))
    }
}


/**
    management service answering the routing commands.

    Each request is answered with a response frame carrying its result in the
    argument bytes; the channel stays locked while a reply is pending so a
    lower priority cannot slip a transmission between request and response.
*/
pub struct Routing<'d, B: BusDriver, C: Clock> {
    interf: Interface<'d, B, C>,
    reply: Option<Frame>,
}

impl<'d, B: BusDriver, C: Clock> Routing<'d, B, C> {
    /// register the service on its channel, `None` if the channel is taken
    pub fn new(dispatcher: &'d Dispatcher<B, C>) -> Option<Self> {
        let mask = Command::RouteList.mask()
            | Command::RouteLine.mask()
            | Command::RouteAdd.mask()
            | Command::RouteDel.mask();
        Some(Self {
            interf: dispatcher.register(ROUTING_CHANNEL, mask)?,
            reply: None,
        })
    }

    /// service one request or reply attempt, to be called on every tick
    pub fn run(&mut self) {
        // a pending reply goes out before anything else
        if let Some(mut frame) = self.reply {
            if self.interf.transmit(&mut frame).is_ok() {
                self.reply = None;
                if !self.interf.pending() {
                    self.interf.unlock();
                }
            }
            return;
        }

        let Some(mut frame) = self.interf.receive()
            else {return};
        // responses looping back are not requests
        if frame.stat.resp()
            {return}

        self.interf.lock();
        let dispatcher = self.interf.dispatcher();
        match frame.cmde {
            Command::RouteList => {
                frame.argv[1] = dispatcher.route_count() as u8;
            }
            Command::RouteLine => match dispatcher.route_line(usize::from(frame.argv[0])) {
                Some((virtual_addr, routed_addr)) => {
                    frame.argv[1] = virtual_addr;
                    frame.argv[2] = routed_addr;
                    frame.argv[3] = 1;
                }
                None => frame.argv[3] = 0,
            },
            Command::RouteAdd => {
                debug!("route add {:#04x} -> {:#04x}", frame.argv[0], frame.argv[1]);
                frame.argv[2] = dispatcher.route_add(frame.argv[0], frame.argv[1]).is_ok() as u8;
            }
            Command::RouteDel => {
                debug!("route del {:#04x} -> {:#04x}", frame.argv[0], frame.argv[1]);
                frame.argv[2] = dispatcher.route_delete(frame.argv[0], frame.argv[1]).is_ok() as u8;
            }
            _ => frame.stat.set_error(true),
        }

        // turn the request into its response, back to the requester
        frame.dest = frame.orig;
        frame.orig = dispatcher.self_address();
        frame.stat.set_resp(true);
        self.reply = Some(frame);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut table = RoutingTable::new();
        let mut out = [0u8; MAX_ROUTES];

        table.add(0x30, 0x40).unwrap();
        table.add(0x31, 0x41).unwrap();
        table.add(0x30, 0x42).unwrap();

        assert_eq!(table.lookup(0x30, &mut out), 2);
        assert_eq!(&out[.. 2], &[0x40, 0x42]);
        assert_eq!(table.lookup(0x31, &mut out), 1);
        assert_eq!(table.lookup(0x32, &mut out), 0);

        table.delete(0x30, 0x40).unwrap();
        assert_eq!(table.lookup(0x30, &mut out), 1);
        assert_eq!(out[0], 0x42);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn delete_missing_leaves_table_unchanged() {
        let mut table = RoutingTable::new();
        table.add(0x30, 0x40).unwrap();

        assert_eq!(table.delete(0x30, 0x41), Err(RouteError::NotFound));
        assert_eq!(table.count(), 1);
        assert_eq!(table.line(0), Some((0x30, 0x40)));
    }

    #[test]
    fn delete_first_match_only() {
        let mut table = RoutingTable::new();
        table.add(0x30, 0x40).unwrap();
        table.add(0x30, 0x40).unwrap();
        table.add(0x30, 0x41).unwrap();

        table.delete(0x30, 0x40).unwrap();
        assert_eq!(table.line(0), Some((0x30, 0x40)));
        assert_eq!(table.line(1), Some((0x30, 0x41)));
        assert_eq!(table.line(2), None);
    }

    #[test]
    fn lookup_truncates_to_capacity() {
        let mut table = RoutingTable::new();
        for routed in 0 .. 5 {
            table.add(0x30, 0x40 + routed).unwrap();
        }

        let mut out = [0u8; 3];
        assert_eq!(table.lookup(0x30, &mut out), 3);
        assert_eq!(out, [0x40, 0x41, 0x42]);
    }

    #[test]
    fn full_table() {
        let mut table = RoutingTable::new();
        for i in 0 .. MAX_ROUTES as u8 {
            table.add(i, i).unwrap();
        }
        assert_eq!(table.add(0x30, 0x40), Err(RouteError::Full));
        assert_eq!(table.count(), MAX_ROUTES);
    }
}

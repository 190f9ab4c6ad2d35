/*!
    networking layer for a node on a shared two-wire master/slave multi-drop
    bus.

    Three tightly coupled pieces make up the layer:

    - the [dispatcher]: the only component touching the physical bus. It
      multiplexes prioritized application channels onto one bus transfer at a
      time, loops local and broadcast frames back to the node's own channels
      and recovers wedged transfers with a deadline watchdog.
    - [dna]: the DHCP-like negotiation giving every node a bus address before
      any application traffic is possible, and replicating the resulting node
      table across the bus.
    - [routing]: a small indirection translating virtual destinations into
      physical ones (relabeling or fan-out) right before frames leave the
      node.

    Everything is driven by a cooperative poll loop: each component exposes a
    non-blocking `poll`/`run` to be called on every scheduler tick. The one
    asynchronous element is the bus hardware completion, delivered through
    [dispatcher::Dispatcher::bus_event] from whatever context the driver
    interrupt runs in.

    The bus hardware and the time source are abstracted by the [bus] traits,
    so whole networks of dispatchers can also run against simulated buses on a
    host.
*/
#![no_std]

mod mutex;

pub mod bus;
pub mod dispatcher;
pub mod dna;
pub mod frame;
pub mod routing;

/*!
    definition of the bus frame, the single message format shared by every
    application on the node.

    The frame layout is fixed at compile time and is also what gets persisted
    by the event logger and serialized by the gateways, so it doubles as a wire
    format: the in-memory struct keeps the fields apart, the bit packing only
    exists in [ToBytes]/[FromBytes].
*/

use bilge::prelude::*;
use packbytes::{ByteArray, FromBytes, ToBytes};


/// number of argument bytes carried by every frame
pub const NB_ARGS: usize = 6;
/// full frame length in bytes
pub const FRAME_SIZE: usize = 5 + NB_ARGS;
/// length of the frame as seen on the bus, the destination being implicit
/// in having been selected as bus target
pub const BODY_SIZE: usize = FRAME_SIZE - 1;


#[macro_export]
macro_rules! pack_bilge {
    ($t:ty) => {

        impl packbytes::ToBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$t>()];

            fn to_le_bytes(self) -> Self::Bytes {
                self.value.value().to_le_bytes()
            }
            fn to_be_bytes(self) -> Self::Bytes {
                self.value.value().to_be_bytes()
            }
        }
        impl packbytes::FromBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$t>()];

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$t as bilge::Bitsized>::ArbitraryInt::from_le_bytes(bytes))
            }
            fn from_be_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$t as bilge::Bitsized>::ArbitraryInt::from_be_bytes(bytes))
            }
        }
    };
}

#[macro_export]
macro_rules! pack_enum {
    ($t:ty) => {

        impl packbytes::ToBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$t>()];

            fn to_le_bytes(self) -> Self::Bytes {
                <$t as bilge::Bitsized>::ArbitraryInt::from(self).to_le_bytes()
            }
            fn to_be_bytes(self) -> Self::Bytes {
                <$t as bilge::Bitsized>::ArbitraryInt::from(self).to_be_bytes()
            }
        }
        impl packbytes::FromBytes for $t {
            type Bytes = [u8; core::mem::size_of::<$t>()];

            fn from_le_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$t as bilge::Bitsized>::ArbitraryInt::from_le_bytes(bytes))
            }
            fn from_be_bytes(bytes: Self::Bytes) -> Self {
                <$t>::from(<$t as bilge::Bitsized>::ArbitraryInt::from_be_bytes(bytes))
            }
        }
    };
}


/**
    command codes

    at most 64 codes are assignable so that any subset can be selected by a
    64 bit channel filter mask, see [Command::mask]

    the core only interprets [TwiRead](Command::TwiRead),
    [TwiWrite](Command::TwiWrite) and the addressing/routing commands; every
    other code is carried opaque for the application owning it
*/
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq)]
pub enum Command {
    /// raw bus read, argv[0] is the number of bytes to read from the remote device
    TwiRead = 0x00,
    /// raw bus write, argv[0] is the number of bytes of argv[1..] to write
    TwiWrite = 0x01,
    #[default]
    NoCommand = 0x02,
    RamRead = 0x03,
    RamWrite = 0x04,
    EepRead = 0x05,
    EepWrite = 0x06,
    FlashRead = 0x07,
    FlashWrite = 0x08,
    Wait = 0x09,
    Container = 0x0a,
    /// node registration, argv[0] = desired address, argv[1] = node kind
    Register = 0x0b,
    /// node table summary, argv[0] = registered slave count, argv[1] = basic slave count
    List = 0x0c,
    /// one node table line, argv[0] = index, argv[1] = kind, argv[2] = address
    Line = 0x0d,
    State = 0x0e,
    TimeGet = 0x0f,
    MuxPower = 0x10,
    /// bus mode reconfiguration, argv[0] = set (0x00) or get (0xff), argv[1] = mode
    ReconfMode = 0x11,
    /// routing management: pair count in argv[1] of the response
    RouteList = 0x12,
    /// routing management: read line argv[0], result in argv[1..=3]
    RouteLine = 0x13,
    /// routing management: add pair (argv[0], argv[1]), success in argv[2]
    RouteAdd = 0x14,
    /// routing management: delete pair (argv[0], argv[1]), success in argv[2]
    RouteDel = 0x15,
    /// decode fallback for unassigned codes
    #[fallback]
    Unknown = 0x3f,
}
pack_enum!(Command);

impl Command {
    /// bit selecting this command in a 64 bit channel filter mask
    pub const fn mask(self) -> u64 {
        1 << (self as u8)
    }
}


/// frame status field, shares its byte with the meaningful argument count
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, DebugBits, PartialEq)]
pub struct Status {
    /// number of meaningful arguments
    pub len: u3,
    /// frame is to be relayed by the serial gateway
    pub serial: bool,
    /// frame is to be relayed by the ethernet gateway
    pub eth: bool,
    /// response synthesized after a bus transfer deadline expired
    pub time_out: bool,
    /// frame is a response
    pub resp: bool,
    /// the requested operation failed
    pub error: bool,
}
pack_bilge!(Status);


/// bus frame header and arguments
#[derive(Copy, Clone, Default, FromBytes, ToBytes, Debug, PartialEq)]
pub struct Frame {
    /// destination address, `0x00` broadcast, `0x01` local node alias, `0x02 ..= 0x7f` nodes
    pub dest: u8,
    /// origin address
    pub orig: u8,
    /// transaction identifier, assigned by the dispatcher on every non-response transmission
    pub t_id: u8,
    /// command code
    pub cmde: Command,
    /// status flags
    pub stat: Status,
    /// command arguments
    pub argv: [u8; NB_ARGS],
}

impl Frame {
    /// build a request frame with zeroed arguments
    pub fn request(dest: u8, orig: u8, cmde: Command) -> Self {
        Self {dest, orig, cmde, .. Default::default()}
    }

    /// set the first arguments, updating the status length field
    pub fn args<const N: usize>(mut self, args: [u8; N]) -> Self {
        self.argv[.. N].copy_from_slice(&args);
        self.stat.set_len(u3::new(N as u8));
        self
    }

    /// frame bytes as transferred on the bus, the destination byte excluded
    pub fn body(&self) -> [u8; BODY_SIZE] {
        let mut body = <[u8; BODY_SIZE]>::zeroed();
        body.copy_from_slice(&self.to_be_bytes()[1 ..]);
        body
    }

    /// rebuild a frame from a received bus body, `None` if the length is not a frame's
    pub fn from_body(dest: u8, body: &[u8]) -> Option<Self> {
        if body.len() != BODY_SIZE
            {return None}
        let mut bytes = <Self as FromBytes>::Bytes::zeroed();
        bytes[0] = dest;
        bytes[1 ..].copy_from_slice(body);
        Some(Self::from_be_bytes(bytes))
    }
}

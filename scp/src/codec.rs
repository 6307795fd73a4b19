//! SDP+SCP datagram framing.
//!
//! Every datagram on the wire is preceded by two zero pad bytes required by
//! the SDP-over-UDP transport, followed by a fixed 12 byte SDP+SCP header,
//! up to three 4-byte arguments, then the payload. All multi-byte header
//! fields are little-endian.

use collections::bytes::Cursor;
use utils::bytes::{self, Cast};
use utils::endian::{u16le, u32le};

pub const PAD_LEN: usize = 2;
pub const HEADER_LEN: usize = 12;
pub const ARG_LEN: usize = 4;
pub const MAX_ARGS: usize = 3;

pub const CMD_READ: u16 = 2;
pub const CMD_WRITE: u16 = 3;
pub const CMD_OK: u16 = 128;

const FLAGS: u8 = 0x87;
const TAG: u8 = 0xFF;
const SRCE_PORT_CPU: u8 = 0xFF;

/// The maximum number of bytes a packed datagram with `na` arguments and a
/// payload of up to `d` bytes can occupy.
pub fn max_len(na: usize, d: usize) -> usize {
    PAD_LEN + HEADER_LEN + ARG_LEN * na + d
}

#[derive(Cast)]
#[repr(C)]
struct Header {
    flags: u8,
    tag: u8,
    dest_port_cpu: u8,
    srce_port_cpu: u8,
    dest_addr: u16le,
    srce_addr: u16le,
    cmd_rc: u16le,
    seq_num: u16le,
}

/// The read/write unit a CMD_READ/CMD_WRITE packet's `arg3` selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Byte = 0,
    Short = 1,
    Word = 2,
}

impl Unit {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Picks the largest unit for which both `address` and `length` are a whole
/// multiple of the unit width.
pub fn rw_unit(address: u32, length: u32) -> Unit {
    if address % 4 == 0 && length % 4 == 0 {
        Unit::Word
    } else if address % 2 == 0 && length % 2 == 0 {
        Unit::Short
    } else {
        Unit::Byte
    }
}

/// Reads the sequence number out of a buffer without consuming it. `buf`
/// must already have had the leading pad bytes stripped and be at least
/// [`HEADER_LEN`] bytes long.
pub fn peek_seq(buf: &[u8]) -> u16 {
    bytes::cast::<Header, _>(&buf[..HEADER_LEN]).seq_num.get()
}

/// Packs an SDP+SCP datagram (pad, header, arguments, truncated payload)
/// into `buf`. `payload` is truncated to `d` bytes. Returns the number of
/// bytes written.
#[allow(clippy::too_many_arguments)]
pub fn pack(buf: Cursor, dest_addr: u16, dest_cpu: u8, cmd_rc: u16, seq_num: u16, args: &[u32], payload: &[u8], d: usize) -> usize {
    assert!(args.len() <= MAX_ARGS);

    let buf = buf.push(&0u8).push(&0u8);

    let (header, mut buf): (&mut Header, _) = buf.split();

    header.flags = FLAGS;
    header.tag = TAG;
    header.dest_port_cpu = dest_cpu & 0x1F;
    header.srce_port_cpu = SRCE_PORT_CPU;
    header.dest_addr = dest_addr.into();
    header.srce_addr = 0u16.into();
    header.cmd_rc = cmd_rc.into();
    header.seq_num = seq_num.into();

    for &a in args {
        buf = buf.push(&u32le::from(a));
    }

    let n = payload.len().min(d);
    buf.push(&payload[..n]);

    PAD_LEN + HEADER_LEN + ARG_LEN * args.len() + n
}

/// Unpacks the `cmd_rc`/`seq_num` fields and up to `want_na` arguments from
/// `buf`, which must already have had the leading pad bytes stripped.
/// `want_na` is clamped downward if `buf` is too short to contain that many
/// argument words. On return, `buf` has been advanced past the header and
/// unpacked arguments, leaving only the payload.
pub fn unpack(buf: &collections::bytes::Slice, want_na: usize) -> (u16, u16, usize, [u32; 3]) {
    let header: &Header = buf.split();

    let cmd_rc = header.cmd_rc.get();
    let seq_num = header.seq_num.get();

    let na = want_na.min(MAX_ARGS).min(buf.len() / ARG_LEN);

    let mut args = [0u32; 3];
    for slot in args.iter_mut().take(na) {
        *slot = buf.split::<u32le>().get();
    }

    (cmd_rc, seq_num, na, args)
}

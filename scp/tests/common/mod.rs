//! Shared scaffolding for the end-to-end scenarios in spec §8: a real
//! `Stakker` core driving a real `scp::Connection` against a mock SpiNNaker
//! peer bound to a second loopback UDP socket.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use collections::bytes::{Cursor, Slice};
use scp::Connection;
use stakker::{actor, ret_nop, ActorOwn, Stakker};

/// Binds a non-blocking loopback socket standing in for a SpiNNaker chip.
pub fn mock_peer() -> UdpSocket {
	let sock = UdpSocket::bind("127.0.0.1:0").expect("bind mock peer socket");
	sock.set_nonblocking(true).expect("set mock peer socket nonblocking");
	sock
}

/// Spawns a `Connection` actor against `peer`, exactly as production code
/// would via `actor!`.
pub fn spawn(core: &mut Stakker, peer: SocketAddr, d: usize, timeout: Duration, attempts: u32, window: usize) -> ActorOwn<Connection> {
	actor!(core, Connection::init(peer, d, timeout, attempts, window), ret_nop!())
}

/// Drives `core`'s timers and socket I/O in short slices, giving `peer_tick`
/// a chance to play the mock peer's side of the conversation between polls,
/// until `done` reports the scenario has finished or `deadline` elapses.
///
/// Polls in bounded slices rather than through `runtime::exec`'s long-lived
/// process loop, which installs a process-wide Ctrl+C handler and has no
/// programmatic stop condition — unsuited to driving many bounded scenarios
/// out of one test binary.
pub fn run_until(core: &mut Stakker, deadline: Duration, mut peer_tick: impl FnMut(), mut done: impl FnMut() -> bool) {
	// Flush the deferred queue from the `call!` that kicked the scenario off
	// before the first poll.
	core.run(Instant::now(), false);

	let start = Instant::now();

	while !done() {
		assert!(start.elapsed() < deadline, "scenario did not complete within {deadline:?}");

		peer_tick();

		let wait = core.next_wait(Instant::now()).unwrap_or(Duration::from_millis(10)).min(Duration::from_millis(10));

		runtime::step(core, Some(wait)).expect("poll step failed");
	}
}

/// Builds a raw datagram the mock peer can hand to `UdpSocket::send_to`,
/// using the crate's own codec exactly as [`Connection`] does — the same
/// idiom as `scp::codec`'s own `packed` test helper.
pub fn build(dest_addr: u16, dest_cpu: u8, code: u16, seq: u16, args: &[u32], payload: &[u8], d: usize) -> Vec<u8> {
	let mut vec = vec![0u8; scp::codec::max_len(args.len(), d)];
	Cursor::vec(&mut vec, |buf| scp::codec::pack(buf, dest_addr, dest_cpu, code, seq, args, payload, d));
	vec
}

/// Unpacks a raw datagram the mock peer received straight off the socket,
/// stripping the pad bytes and handing the rest to `scp::codec::unpack`.
pub fn parse(buf: &[u8], want_na: usize) -> (u16, u16, usize, [u32; 3], Vec<u8>) {
	let mut slice = Slice::new(buf.len() - scp::codec::PAD_LEN);
	slice.copy_from_slice(&buf[scp::codec::PAD_LEN..]);

	let (code, seq, na, args) = scp::codec::unpack(&slice, want_na);
	(code, seq, na, args, slice.to_vec())
}

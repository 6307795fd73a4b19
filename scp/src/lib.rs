#![feature(try_blocks, trivial_bounds)]

//! A client-side transport for the SpiNNaker Command Protocol (SCP): an
//! SDP-framed request/response protocol over UDP that keeps many outstanding
//! commands in flight at once, including the sharding of bulk memory
//! read/write into many small packets.
//!
//! [`Connection`] is the whole of it, built as a `stakker` actor exactly as
//! `wireguard::Wireguard` is in the sibling crate: one per remote endpoint,
//! hosted on the caller's `Stakker` core and driven by `runtime`'s event
//! loop. The demo CLI, DNS resolution, and any particular choice of
//! logging backend are the caller's concern, not this crate's.

pub mod codec;
pub mod error;
pub mod queue;
pub mod request;
pub mod slot;

use core::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::cell::RefCell;
use std::net::UdpSocket;
use std::rc::Rc;
use std::time::Duration;

use collections::bytes::{Cursor, Slice};
use log::{debug, warn};
use queue::Queue;
use request::{Request, RwKind, RwRequest, RwShared, ScpRequest};
use runtime::Io;
use slot::{Slot, SlotKind};
use stakker::{fwd_to, FixedTimerKey, Ret, CX};
use utils::error::*;

pub use error::{err_message, err_name, Error};

/// A successful SCP command reply.
pub struct ScpReply {
	pub cmd_rc: u16,
	pub n_args: usize,
	pub args: [u32; 3],
	/// The response payload, clamped to the caller's requested capacity.
	pub payload: Vec<u8>,
}

pub type ScpResult = Result<ScpReply, Error>;

/// A completed bulk read/write. For a read, `buffer` holds the data read
/// from the machine; for a write, it is the caller's original buffer handed
/// back unmodified, per spec §3's "original buffer descriptor ... returned
/// to the user in the completion callback".
pub struct RwReply {
	pub buffer: Vec<u8>,
}

pub type RwResult = Result<RwReply, Error>;

/// One connection to a SpiNNaker chip's SCP listener. See spec §3 for the
/// full data model this mirrors field-for-field.
pub struct Connection {
	socket: Io<UdpSocket>,
	slots: Vec<Slot>,
	queue: Queue<Request>,
	next_seq: u16,
	next_rw_id: u32,
	/// Maximum SCP payload length in a single datagram.
	d: usize,
	/// Per-attempt timeout.
	timeout: Duration,
	/// Attempt limit per sequence number.
	attempts: u32,
	freeing: bool,
	free_cb: Option<Ret<()>>,
}

impl Connection {
	/// Opens a UDP socket connected to `peer` and allocates `window` slots.
	/// Mirrors `wireguard::Wireguard::init`'s socket setup.
	pub fn init(cx: CX![], peer: SocketAddr, d: usize, timeout: Duration, attempts: u32, window: usize) -> Option<Self> {
		assert!(attempts >= 1, "attempt limit N must be at least 1");
		assert!(window >= 1, "outstanding window W must be at least 1");

		let socket: std::io::Result<UdpSocket> = try {
			let socket = UdpSocket::bind::<SocketAddr>(match peer {
				SocketAddr::V4(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
				SocketAddr::V6(_) => SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into(),
			})?;

			socket.set_nonblocking(true)?;
			socket.connect(peer)?;

			socket
		};

		let socket = socket.ok_or(|err| warn!("Failed to bind SCP socket: {err}"))?;

		let read_fwd = fwd_to!([cx], on_datagram() as (Slice));
		let socket = Io::new(socket, read_fwd);

		let cap = codec::max_len(codec::MAX_ARGS, d);
		let slots = (0..window).map(|_| Slot::new(cap)).collect();

		Some(Self {
			socket,
			slots,
			queue: Queue::new(),
			next_seq: 0,
			next_rw_id: 0,
			d,
			timeout,
			attempts,
			freeing: false,
			free_cb: None,
		})
	}

	fn take_seq(&mut self) -> u16 {
		let seq = self.next_seq;
		self.next_seq = self.next_seq.wrapping_add(1);
		seq
	}

	fn take_rw_id(&mut self) -> u32 {
		let id = self.next_rw_id;
		self.next_rw_id = self.next_rw_id.wrapping_add(1);
		id
	}

	// --- Public submission API (spec §6) -----------------------------------

	/// Queues an SCP command. `payload` is the request's argument data (may
	/// be empty); `capacity` bounds how many response payload bytes are
	/// copied back to the caller.
	#[allow(clippy::too_many_arguments)]
	pub fn submit_scp(
		&mut self,
		cx: CX![],
		dest_addr: u16,
		dest_cpu: u8,
		cmd: u16,
		na_s: usize,
		na_r: usize,
		a1: u32,
		a2: u32,
		a3: u32,
		payload: Vec<u8>,
		capacity: usize,
		cb: Ret<ScpResult>,
	) {
		if self.freeing {
			cb.ret(Err(Error::Free));
			return;
		}

		let req = ScpRequest {
			dest_addr,
			dest_cpu,
			cmd,
			na_s: na_s.min(codec::MAX_ARGS),
			na_r: na_r.min(codec::MAX_ARGS),
			args: [a1, a2, a3],
			buffer: payload,
			capacity,
			cb,
		};

		self.queue.insert(Request::Scp(req));
		self.schedule(cx);
	}

	/// Queues a bulk write of `buffer` to `address`.
	pub fn submit_write(&mut self, cx: CX![], dest_addr: u16, dest_cpu: u8, address: u32, buffer: Vec<u8>, cb: Ret<RwResult>) {
		self.submit_rw(cx, RwKind::Write, dest_addr, dest_cpu, address, buffer, cb)
	}

	/// Queues a bulk read of `len(buffer)` bytes from `address` into `buffer`.
	pub fn submit_read(&mut self, cx: CX![], dest_addr: u16, dest_cpu: u8, address: u32, buffer: Vec<u8>, cb: Ret<RwResult>) {
		self.submit_rw(cx, RwKind::Read, dest_addr, dest_cpu, address, buffer, cb)
	}

	fn submit_rw(&mut self, cx: CX![], kind: RwKind, dest_addr: u16, dest_cpu: u8, address: u32, buffer: Vec<u8>, cb: Ret<RwResult>) {
		if self.freeing {
			cb.ret(Err(Error::Free));
			return;
		}

		// Nothing to shard: complete immediately rather than occupy a slot
		// with a zero-length packet (sharding totality wants zero shards).
		if buffer.is_empty() {
			cb.ret(Ok(RwReply { buffer }));
			return;
		}

		let rw_id = self.take_rw_id();
		let shared = Rc::new(RefCell::new(RwShared { rw_id, kind, buffer, cb: Some(cb) }));

		let req = RwRequest { dest_addr, dest_cpu, address, offset: 0, shared };

		self.queue.insert(Request::Rw(req));
		self.schedule(cx);
	}

	// --- Scheduler (spec §4.3) ---------------------------------------------

	/// Drains the request queue into free slots. Re-entered whenever a user
	/// submits a request, a slot completes or is cancelled, or a deferred
	/// send completion finds the slot already freed or cancelled.
	fn schedule(&mut self, cx: CX![]) {
		if self.freeing {
			return;
		}

		loop {
			let Some(idx) = self.slots.iter().position(|s| !s.active) else { return };
			let Some(entry) = self.queue.peek() else { return };

			let is_scp = matches!(self.queue.get(entry), Request::Scp(_));

			if is_scp {
				let Some(Request::Scp(req)) = self.queue.remove() else { unreachable!("peeked entry was Scp") };
				self.place_scp(cx, idx, req);
				continue;
			}

			let kind;
			let rw_id;
			let address;
			let offset;
			let n;
			let shared;
			let dest_addr;
			let dest_cpu;
			let done;

			{
				let Request::Rw(req) = self.queue.get_mut(entry) else { unreachable!("just checked this was Rw") };

				let total = req.shared.borrow().buffer.len();
				n = (total - req.offset).min(self.d);

				offset = req.offset;
				address = req.address;
				shared = req.shared.clone();
				kind = shared.borrow().kind;
				rw_id = shared.borrow().rw_id;
				dest_addr = req.dest_addr;
				dest_cpu = req.dest_cpu;

				req.offset += n;
				req.address = req.address.wrapping_add(n as u32);
				done = req.offset >= total;
			}

			self.place_rw(cx, idx, kind, rw_id, address, offset, n, shared, dest_addr, dest_cpu);

			if done {
				self.queue.remove();
			}
		}
	}

	fn pack_into(&mut self, idx: usize, dest_addr: u16, dest_cpu: u8, cmd_rc: u16, seq: u16, args: &[u32], payload: &[u8]) -> usize {
		let cap = codec::max_len(codec::MAX_ARGS, self.d);
		let d = self.d;

		let buf = &mut self.slots[idx].buf;
		buf.resize(cap, 0);

		Cursor::vec(buf, |buf| codec::pack(buf, dest_addr, dest_cpu, cmd_rc, seq, args, payload, d))
	}

	fn place_scp(&mut self, cx: CX![], idx: usize, req: ScpRequest) {
		let seq = self.take_seq();

		let args = req.args;
		let na_s = req.na_s;
		let len = self.pack_into(idx, req.dest_addr, req.dest_cpu, req.cmd, seq, &args[..na_s], &req.buffer);

		let slot = &mut self.slots[idx];
		slot.active = true;
		slot.seq = seq;
		slot.n_tries = 1;
		slot.len = len;
		slot.kind = Some(SlotKind::Scp { cb: req.cb, na_r: req.na_r, capacity: req.capacity });

		self.attempt_send(cx, idx);
	}

	#[allow(clippy::too_many_arguments)]
	fn place_rw(
		&mut self,
		cx: CX![],
		idx: usize,
		kind: RwKind,
		rw_id: u32,
		address: u32,
		offset: usize,
		n: usize,
		shared: Rc<RefCell<RwShared>>,
		dest_addr: u16,
		dest_cpu: u8,
	) {
		let seq = self.take_seq();

		let unit = codec::rw_unit(address, n as u32);
		let args = [address, n as u32, unit.code()];

		let cmd = match kind {
			RwKind::Read => codec::CMD_READ,
			RwKind::Write => codec::CMD_WRITE,
		};

		let payload: Vec<u8> = match kind {
			RwKind::Write => shared.borrow().buffer[offset..offset + n].to_vec(),
			RwKind::Read => Vec::new(),
		};

		let len = self.pack_into(idx, dest_addr, dest_cpu, cmd, seq, &args, &payload);

		debug!("scp rw_id={rw_id:#010x}: sharding [{offset}..{}) to seq={seq:#06x}", offset + n);

		let slot = &mut self.slots[idx];
		slot.active = true;
		slot.seq = seq;
		slot.n_tries = 1;
		slot.len = len;
		slot.kind = Some(SlotKind::Rw { kind, shared, offset, len: n });

		self.attempt_send(cx, idx);
	}

	// --- Outstanding slot state machine (spec §4.4) ------------------------

	fn attempt_send(&mut self, cx: CX![], idx: usize) {
		self.slots[idx].send_in_flight = true;

		let datagram = self.slots[idx].buf[..self.slots[idx].len].to_vec();
		let result = self.socket.write(|mut c| c.push(&datagram[..]));

		self.slots[idx].send_in_flight = false;

		match result {
			Ok(()) => {
				if self.slots[idx].cancelled {
					self.slots[idx].active = false;
					let err = self.slots[idx].pending_err.take().unwrap_or(Error::Free);
					self.finalize_cancel(cx, idx, err);
				} else {
					self.arm_timer(cx, idx);
				}
			}
			Err(()) => {
				warn!("send() failed for an outstanding SCP slot");
				self.cancel_outstanding(cx, idx, Error::Send);
			}
		}
	}

	fn arm_timer(&mut self, cx: CX![], idx: usize) {
		let actor = cx.access_actor().clone();
		let timeout = self.timeout;

		self.slots[idx].timer = cx.after(timeout, move |s| actor.apply(s, move |this, cx| this.on_timer(cx, idx)));
	}

	fn stop_timer(&mut self, cx: CX![], idx: usize) {
		let slot = &mut self.slots[idx];

		if slot.timer != FixedTimerKey::default() {
			cx.timer_del(slot.timer);
			slot.timer = FixedTimerKey::default();
		}
	}

	fn on_timer(&mut self, cx: CX![], idx: usize) {
		if !self.slots[idx].active {
			// Stale fire raced with a cancellation that already stopped us;
			// `stop_timer` should prevent this, but cheap to guard anyway.
			return;
		}

		if self.slots[idx].n_tries < self.attempts {
			self.slots[idx].n_tries += 1;
			self.attempt_send(cx, idx);
		} else {
			self.cancel_outstanding(cx, idx, Error::Timeout);
		}
	}

	/// Cancels one outstanding slot (spec §4.6). No-op if the slot is
	/// already inactive or already cancelled.
	fn cancel_outstanding(&mut self, cx: CX![], idx: usize, err: Error) {
		let slot = &mut self.slots[idx];

		if !slot.active || slot.cancelled {
			return;
		}

		if slot.send_in_flight {
			// The callback fires once the deferred send completes; see
			// `attempt_send`'s continuation.
			slot.cancelled = true;
			slot.pending_err = Some(err);
			return;
		}

		self.stop_timer(cx, idx);
		self.slots[idx].active = false;
		self.finalize_cancel(cx, idx, err);
	}

	/// Fires (or propagates to siblings) the completion for a slot that has
	/// just become inactive due to cancellation, send failure, or timeout.
	fn finalize_cancel(&mut self, cx: CX![], idx: usize, err: Error) {
		let slot = &mut self.slots[idx];
		slot.cancelled = false;
		slot.pending_err = None;
		let kind = slot.kind.take();

		match kind {
			None => {}

			Some(SlotKind::Scp { cb, .. }) => cb.ret(Err(err)),

			Some(SlotKind::Rw { shared, .. }) => {
				let rw_id = shared.borrow().rw_id;

				let siblings: Vec<usize> = self
					.slots
					.iter()
					.enumerate()
					.filter(|(i, s)| *i != idx && s.active && s.belongs_to_rw(rw_id))
					.map(|(i, _)| i)
					.collect();

				if siblings.is_empty() {
					if self.rw_residual_at_head(rw_id) {
						self.queue.remove();
					}

					if let Some(cb) = shared.borrow_mut().cb.take() {
						cb.ret(Err(err));
					}
				} else {
					for sib in siblings {
						self.cancel_outstanding(cx, sib, err.clone());
					}
				}
			}
		}

		self.schedule(cx);
	}

	fn rw_residual_at_head(&self, rw_id: u32) -> bool {
		self.queue
			.peek()
			.is_some_and(|entry| matches!(self.queue.get(entry), Request::Rw(r) if r.shared.borrow().rw_id == rw_id))
	}

	// --- Dispatcher (spec §4.5) ---------------------------------------------

	/// Routes one inbound datagram by sequence number. Bound to the socket's
	/// read forward at [`Connection::init`].
	fn on_datagram(&mut self, cx: CX![], buf: Slice) {
		if buf.len() < codec::PAD_LEN + codec::HEADER_LEN {
			debug!("dropped undersized SCP datagram ({} bytes)", buf.len());
			return;
		}

		buf.split_bytes(codec::PAD_LEN);

		let seq = codec::peek_seq(&buf);

		let Some(idx) = self.slots.iter().position(|s| s.active && s.seq == seq) else {
			debug!("dropped datagram with unmatched sequence number {seq:#06x}");
			return;
		};

		self.stop_timer(cx, idx);

		if matches!(self.slots[idx].kind, Some(SlotKind::Rw { .. })) {
			self.dispatch_rw(cx, idx, &buf);
		} else {
			self.dispatch_scp(idx, &buf);
			self.schedule(cx);
		}
	}

	fn dispatch_scp(&mut self, idx: usize, buf: &Slice) {
		let Some(SlotKind::Scp { cb, na_r, capacity }) = self.slots[idx].kind.take() else {
			unreachable!("checked this was Scp");
		};

		let (cmd_rc, _seq, na, args) = codec::unpack(buf, na_r);

		let n = buf.len().min(capacity);
		let mut payload = vec![0u8; n];
		payload.copy_from_slice(&buf[..n]);

		self.slots[idx].active = false;

		cb.ret(Ok(ScpReply { cmd_rc, n_args: na, args, payload }));
	}

	fn dispatch_rw(&mut self, cx: CX![], idx: usize, buf: &Slice) {
		let (cmd_rc, _seq, _na, _args) = codec::unpack(buf, 0);

		if cmd_rc != codec::CMD_OK {
			warn!("scp rw shard returned non-OK response code {cmd_rc}");
			self.slots[idx].active = false;
			self.finalize_cancel(cx, idx, Error::BadRc(cmd_rc));
			return;
		}

		let Some(SlotKind::Rw { kind, shared, offset, len }) = self.slots[idx].kind.take() else {
			unreachable!("checked this was Rw");
		};

		if kind == RwKind::Read {
			let n = buf.len().min(len);
			shared.borrow_mut().buffer[offset..offset + n].copy_from_slice(&buf[..n]);
		}

		self.slots[idx].active = false;

		self.complete_rw(shared);
		self.schedule(cx);
	}

	/// Fires the bulk request's callback if (and only if) this was the last
	/// shard still referring to it and it no longer sits at the head of the
	/// queue (spec §4.5).
	fn complete_rw(&mut self, shared: Rc<RefCell<RwShared>>) {
		let rw_id = shared.borrow().rw_id;

		let any_sibling_active = self.slots.iter().any(|s| s.active && s.belongs_to_rw(rw_id));

		if any_sibling_active || self.rw_residual_at_head(rw_id) {
			return;
		}

		if let Some(cb) = shared.borrow_mut().cb.take() {
			let buffer = std::mem::take(&mut shared.borrow_mut().buffer);
			cb.ret(Ok(RwReply { buffer }));
		}
	}

	// --- Teardown (spec §4.7) -----------------------------------------------

	/// Asynchronous teardown: cancels every outstanding slot and drains the
	/// queue with [`Error::Free`], then invokes `cb` once all of that
	/// settles. Idempotent; a second call while already freeing is a no-op.
	pub fn free(&mut self, cx: CX![], cb: Option<Ret<()>>) {
		if self.freeing {
			return;
		}

		self.freeing = true;
		self.free_cb = cb;

		for idx in 0..self.slots.len() {
			self.cancel_outstanding(cx, idx, Error::Free);
		}

		while let Some(req) = self.queue.remove() {
			match req {
				Request::Scp(req) => req.cb.ret(Err(Error::Free)),
				Request::Rw(req) => {
					if let Some(cb) = req.shared.borrow_mut().cb.take() {
						cb.ret(Err(Error::Free));
					}
				}
			}
		}

		self.finish_free();
	}

	/// The original's multi-phase free waits here for every async handle
	/// close (socket, per-slot timers, in-flight sends) to be observed
	/// before releasing memory, re-entering `free` from each close callback.
	/// `runtime::Io`'s socket teardown and `stakker`'s timer cancellation are
	/// both synchronous, so by the time `cancel_outstanding` and the queue
	/// drain above return there is nothing left to wait for; `self` is
	/// released when the caller drops its `ActorOwn<Connection>`.
	fn finish_free(&mut self) {
		if let Some(cb) = self.free_cb.take() {
			cb.ret(());
		}
	}
}

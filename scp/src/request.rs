//! Queued user requests: the entries the [`crate::queue::Queue`] holds until
//! the scheduler places them into a slot.

use std::cell::RefCell;
use std::rc::Rc;

use stakker::Ret;

use crate::{RwResult, ScpResult};

/// A queued SCP command. Fully consumed by a single slot.
pub struct ScpRequest {
	pub dest_addr: u16,
	pub dest_cpu: u8,
	pub cmd: u16,
	pub na_s: usize,
	pub na_r: usize,
	pub args: [u32; 3],
	/// The bytes to send. Truncated to `D` by the codec if longer.
	pub buffer: Vec<u8>,
	/// The capacity of the caller's receive buffer; the response payload is
	/// clamped to this on delivery.
	pub capacity: usize,
	pub cb: Ret<ScpResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwKind {
	Read,
	Write,
}

/// State shared between every slot sharding the same bulk read/write, and
/// between those slots and the (possibly already-removed) queue entry.
/// Outlives the queue entry: the entry is removed from the queue as soon as
/// it has been fully sharded into slots, but the last slot to complete still
/// needs the buffer and the callback.
pub struct RwShared {
	pub rw_id: u32,
	pub kind: RwKind,
	/// The caller's full buffer: written into for READ, read from for WRITE.
	pub buffer: Vec<u8>,
	/// Taken and fired exactly once, by the last shard to complete.
	pub cb: Option<Ret<RwResult>>,
}

/// A queued bulk read/write. Remains at the head of the queue across many
/// scheduler invocations while the scheduler shards it, mutating `address`
/// and `offset` in place.
pub struct RwRequest {
	pub dest_addr: u16,
	pub dest_cpu: u8,
	/// The address of the next shard to be carved off.
	pub address: u32,
	/// How far into `shared.buffer` sharding has progressed.
	pub offset: usize,
	pub shared: Rc<RefCell<RwShared>>,
}

impl RwRequest {
	/// Bytes not yet assigned to a shard.
	pub fn remaining(&self) -> usize {
		self.shared.borrow().buffer.len() - self.offset
	}
}

pub enum Request {
	Scp(ScpRequest),
	Rw(RwRequest),
}

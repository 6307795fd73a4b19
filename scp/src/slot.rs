//! The per-in-flight-packet state machine described in spec §4.4: one of `W`
//! fixed slots owned by the [`crate::Connection`] for its whole lifetime.

use std::cell::RefCell;
use std::rc::Rc;

use stakker::{FixedTimerKey, Ret};

use crate::error::Error;
use crate::request::{RwKind, RwShared};
use crate::{RwResult, ScpResult};

/// The type-specific fields needed to deliver a response, carried by an
/// active slot. Mirrors the two queued [`crate::request::Request`] variants.
pub enum SlotKind {
	Scp {
		cb: Ret<ScpResult>,
		/// Requested response argument count, clamped further by the
		/// codec if the reply is short.
		na_r: usize,
		capacity: usize,
	},
	Rw {
		kind: RwKind,
		shared: Rc<RefCell<RwShared>>,
		/// Offset into `shared.buffer` this shard's payload belongs at.
		offset: usize,
		/// Length of this shard's payload.
		len: usize,
	},
}

/// One outstanding packet context. `active=false` means IDLE; the other
/// states (SENDING/AWAITING/COMPLETING/CANCELLING) are distinguished by
/// `kind`, `send_in_flight` and `cancelled` rather than an explicit enum,
/// since the transitions in spec §4.4 are driven by which fields are set.
pub struct Slot {
	pub active: bool,
	/// Set only while `send_in_flight`; the callback fires once the send
	/// completes instead of immediately (spec §4.6 step 2).
	pub cancelled: bool,
	/// The error to deliver once a deferred cancellation can complete.
	pub pending_err: Option<Error>,
	pub send_in_flight: bool,
	pub seq: u16,
	pub n_tries: u32,
	pub timer: FixedTimerKey,
	/// Pre-allocated packet buffer, capacity `header + D + 2` per shard (the
	/// codec always sizes it to the connection's worst case, three
	/// arguments).
	pub buf: Vec<u8>,
	/// Length of the packed datagram currently sitting in `buf`.
	pub len: usize,
	pub kind: Option<SlotKind>,
}

impl Slot {
	pub fn new(buf_cap: usize) -> Self {
		Self {
			active: false,
			cancelled: false,
			pending_err: None,
			send_in_flight: false,
			seq: 0,
			n_tries: 0,
			timer: FixedTimerKey::default(),
			buf: vec![0u8; buf_cap],
			len: 0,
			kind: None,
		}
	}

	/// Whether this slot is carrying a shard of the bulk request `rw_id`.
	pub fn belongs_to_rw(&self, rw_id: u32) -> bool {
		matches!(&self.kind, Some(SlotKind::Rw { shared, .. }) if shared.borrow().rw_id == rw_id)
	}
}

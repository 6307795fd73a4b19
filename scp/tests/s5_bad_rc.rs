//! S5 (spec §8): a non-OK response code on one shard of a bulk request
//! must fail the whole request with exactly one callback, and no further
//! shard may be sent afterward.

mod common;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use scp::codec::CMD_OK;
use scp::{Error, RwResult};
use stakker::{call, Ret};

use common::{build, mock_peer, parse, run_until, spawn};

#[test]
fn bad_rc_stops_the_bulk_request_after_one_callback() {
	let peer = mock_peer();
	let peer_addr: SocketAddr = peer.local_addr().unwrap();

	let mut core = runtime::init();
	// window=1 keeps shards strictly sequential so the 4th (bad) shard is
	// unambiguously the last one sent.
	let conn = spawn(&mut core, peer_addr, 4, Duration::from_millis(200), 3, 1);

	let data = vec![0xABu8; 16]; // four 4-byte shards at D=4

	let result: Rc<RefCell<Option<RwResult>>> = Rc::new(RefCell::new(None));
	let result_cb = result.clone();

	call!(
		[conn],
		submit_write(0, 0, 0x3000, data, Ret::new(move |r| *result_cb.borrow_mut() = Some(r)))
	);

	let shards_seen = Rc::new(RefCell::new(0u32));
	let shards_seen_tick = shards_seen.clone();

	run_until(
		&mut core,
		Duration::from_secs(2),
		move || {
			let mut buf = [0u8; 1500];

			while let Ok((n, from)) = peer.recv_from(&mut buf) {
				let mut seen = shards_seen_tick.borrow_mut();
				*seen += 1;

				let (_cmd, seq, _na, _args, _payload) = parse(&buf[..n], 3);

				let reply = if *seen < 4 { build(0, 0, CMD_OK, seq, &[], &[], 0) } else { build(0, 0, 7, seq, &[], &[], 0) };

				peer.send_to(&reply, from).expect("reply to write shard");
			}
		},
		|| result.borrow().is_some(),
	);

	let err = result.borrow_mut().take().unwrap().expect_err("a non-OK shard must fail the whole request");
	assert_eq!(err, Error::BadRc(7));
	assert_eq!(*shards_seen.borrow(), 4, "the scheduler must not send a 5th shard after the bad one");
}

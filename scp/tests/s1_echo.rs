//! S1 (spec §8): a single SCP command sent to a peer that echoes a reply
//! back immediately must deliver that reply to the submitter's callback.

mod common;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use scp::ScpResult;
use stakker::{call, Ret};

use common::{build, mock_peer, parse, run_until, spawn};

#[test]
fn echo_round_trip() {
	let peer = mock_peer();
	let peer_addr: SocketAddr = peer.local_addr().unwrap();

	let mut core = runtime::init();
	let conn = spawn(&mut core, peer_addr, 64, Duration::from_millis(100), 3, 2);

	let result: Rc<RefCell<Option<ScpResult>>> = Rc::new(RefCell::new(None));
	let result_cb = result.clone();

	call!(
		[conn],
		submit_scp(
			0x0102,
			3,
			42,
			2,
			2,
			0x1112_1314,
			0x2122_2324,
			0,
			b"Hello, world!".to_vec(),
			64,
			Ret::new(move |r| *result_cb.borrow_mut() = Some(r))
		)
	);

	let mut replied = false;

	run_until(
		&mut core,
		Duration::from_secs(2),
		|| {
			if replied {
				return;
			}

			let mut buf = [0u8; 1500];
			let Ok((n, from)) = peer.recv_from(&mut buf) else { return };

			let (_cmd, seq, _na, _args, _payload) = parse(&buf[..n], 2);
			let reply = build(0, 0, 0, seq, &[0xAAAA_AAAA, 0xBBBB_BBBB], b"pong", 64);

			peer.send_to(&reply, from).expect("reply to echo request");
			replied = true;
		},
		|| result.borrow().is_some(),
	);

	let reply = result.borrow_mut().take().unwrap().expect("echo should succeed");

	assert_eq!(reply.cmd_rc, 0);
	assert_eq!(reply.n_args, 2);
	assert_eq!(reply.args, [0xAAAA_AAAA, 0xBBBB_BBBB, 0]);
	assert_eq!(reply.payload, b"pong");
}

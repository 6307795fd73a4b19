//! The error type delivered to user completion callbacks, matching the pair
//! of diagnostic accessors in §6 (`err_name`/`err_message`).

use core::fmt;

/// A failure delivered to a completion callback instead of a successful
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// A READ or WRITE shard received a response code other than
	/// [`crate::codec::CMD_OK`]. Carries the code the peer actually sent.
	BadRc(u16),
	/// `N` send attempts on one sequence number elapsed with no matching
	/// reply.
	Timeout,
	/// The request was cancelled by [`crate::Connection::free`].
	Free,
	/// A `send()` on the underlying socket failed.
	Send,
}

impl Error {
	/// A short symbolic name for the error, matching the `rs_err_name` style
	/// of the original implementation.
	pub fn name(&self) -> &'static str {
		match self {
			Error::BadRc(_) => "BAD_RC",
			Error::Timeout => "TIMEOUT",
			Error::Free => "FREE",
			Error::Send => "SEND",
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::BadRc(rc) => write!(f, "peer returned a non-OK response code ({rc})"),
			Error::Timeout => write!(f, "timed out waiting for a reply"),
			Error::Free => write!(f, "the connection was freed"),
			Error::Send => write!(f, "failed to send a datagram"),
		}
	}
}

impl std::error::Error for Error {}

/// A short symbolic name for `err`. See [`Error::name`].
pub fn err_name(err: &Error) -> &'static str {
	err.name()
}

/// A human-readable sentence describing `err`. See the [`fmt::Display`] impl.
pub fn err_message(err: &Error) -> String {
	err.to_string()
}

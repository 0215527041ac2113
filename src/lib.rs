//! Stream listeners with a dynamically adjustable cap on simultaneously open connections, and
//! graceful shutdown which waits for those connections to finish.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

mod coordinator;
mod error;
mod gate;
#[cfg(unix)]
pub mod inherit;
mod jar;
mod listener;
pub mod net;

pub use error::{Error, Op, Result};
pub use jar::MAX_CONNS;
pub use listener::{ListenerState, ThrottledConn, ThrottledListener};
pub use net::{Connection, Listener};

//! Single-room TCP relay that fans each client's bytes out to every other
//! connected client, verbatim and unframed.
//!
//! There is no protocol on the wire: whatever chunk of bytes a read returns
//! is broadcast as-is, so a single read may carry a partial or several
//! logical messages. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface; the listen port is the only
//!   option.
//! - [`event`] defines the events flowing from the accept loop and the
//!   per-connection reader tasks into the dispatcher.
//! - [`relay`] accepts TCP connections, runs the single dispatcher task that
//!   owns the client registry, and performs the broadcast writes.
//!
//! All registry mutation happens on one task fed by one mpsc channel, so the
//! client table needs no locking. Integration tests use this crate directly
//! to exercise the dispatcher state machine over loopback sockets.

pub mod cli;
pub mod event;
pub mod relay;

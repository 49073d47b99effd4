//! End-to-end helpers: in-process daemons sharing a memory broker, driven
//! through their real control sockets.

pub mod harness;

//! Network-facing infrastructure: interface address resolution, the client
//! listener, the accept/session loop and the UDP discovery beacon.

pub mod acceptor;
pub mod addr;
pub mod beacon;
pub mod server;

//! Infrastructure layer: network listeners, CAN bus transports, the service
//! discovery beacon, interface statistics and configuration storage.

pub mod bus;
pub mod network;
pub mod stats;
pub mod storage;

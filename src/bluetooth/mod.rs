//! Consumed Bluetooth transports: LE advertisement scanning and the L2CAP
//! sequenced-packet channel the AAP session runs over.

pub mod l2cap;
pub mod scan;

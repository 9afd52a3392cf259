pub mod comms;
pub mod config;
pub mod protocol;
pub mod test_util;
pub mod transport;
pub mod util;

//! Control channel: a local Unix socket carrying one text command per connection.

pub mod client;
pub mod protocol;
pub mod server;

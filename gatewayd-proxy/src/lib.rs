pub mod client;
pub mod pool;
pub mod proxy;
pub mod worker;

pub use client::Client;
pub use pool::Pool;
pub use proxy::{ConnId, Proxy};
pub use worker::Server;

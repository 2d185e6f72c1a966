pub mod config;
pub mod driver;
pub mod echo;
pub mod gate;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod stats;
pub mod transport;

pub mod annotate;
pub mod config;
pub mod datalog;
pub mod error;
pub mod evaluate;
pub mod live;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod shapes;
pub mod video;
pub mod worker;

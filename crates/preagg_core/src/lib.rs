pub mod buffer;
pub mod chunk;
pub mod config;
pub mod datum;
pub mod device;
pub mod dispatch;
pub mod explain;
pub mod kernels;
pub mod mode;
pub mod output;
pub mod plan;
pub mod shared_state;
pub mod statistics;
pub mod task;

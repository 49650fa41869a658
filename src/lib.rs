pub mod bus;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod regime;
pub mod reliability;
pub mod reputation;
pub mod state;
pub mod storage;

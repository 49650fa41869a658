pub mod circuit;
pub mod refractory;
pub mod wal;

pub mod config;
pub mod heal;
pub mod iaas;
pub mod storage;

pub use storage::Storage;

pub mod access;
pub mod migrate;
pub mod show;
pub mod sync;

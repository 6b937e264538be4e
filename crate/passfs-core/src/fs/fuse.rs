mod dirstream;
mod error;
mod handles;
mod inodes;
mod interface;
mod operations;

#[cfg(test)]
mod testing;

pub use interface::{FuseHandle, export};

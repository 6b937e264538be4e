pub mod fuse;
pub mod path;

mod cluster;

pub use cluster::*;

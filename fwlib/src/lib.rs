pub mod devices;
pub mod download;
pub mod firmware;
pub mod resolver;
pub mod similarity;
pub mod transport;

pub mod cloud;
pub mod config;
pub mod error;
pub mod features;
pub mod geometry;
pub mod image;
pub mod map;
pub mod mapping;
pub mod optimizer;
pub mod system;
pub mod tracking;

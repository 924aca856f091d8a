//! Object detection on uploaded images and live camera streams, served over HTTP.

pub mod annotate;
pub mod encode;
pub mod endpoints;
pub mod error;
pub mod labels;
pub mod meter;
pub mod nn;
pub mod pages;
pub mod publisher;
pub mod routes;
pub mod sensors;
pub mod settings;
pub mod upload;
pub mod utils;

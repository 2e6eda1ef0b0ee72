//! Web front end to run an object detection model on uploaded images and a live camera stream.

pub mod annotate;
pub mod bootstrap;
pub mod config;
pub mod detection;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod pages;
pub mod responder;
pub mod sensors;
pub mod storage;
pub mod upload;
pub mod utils;

//! Remote xpcshell test orchestration over adb.
//!
//! The crate provisions a workspace on an Android device, deploys the test
//! harness and its native libraries for the device's ABI, and runs each test
//! script as a supervised process on the device.

pub mod config;
pub mod device;
pub mod error;
pub mod manifest;
pub mod remote;

pub use error::{Error, Result, XpcRemoteError};

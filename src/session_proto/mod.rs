//! Automation session protocol: length-prefixed JSON frames between the
//! session runtime and an external automation controller.

pub mod rpc;
pub mod wire;

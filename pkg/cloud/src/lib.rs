//! Capability surface of the remote load-balancing API.
//!
//! The reconcilers only ever talk to a [`CloudGateway`]. Two implementations ship here:
//! [`HttpGateway`] for a real endpoint and [`MemoryGateway`], an in-process fake that
//! records every call and backs dry runs and tests.

pub mod gateway;
pub mod http;
pub mod memory;
pub mod model;

pub use gateway::{CloudGateway, GatewayError};
pub use http::HttpGateway;
pub use memory::{GatewayCall, MemoryGateway};

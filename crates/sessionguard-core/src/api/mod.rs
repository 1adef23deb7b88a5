//! Backend communication.
//!
//! This module provides the `Transport` seam with its `reqwest`
//! implementation, and the `AuthorizedClient` that performs bearer-authenticated
//! requests with refresh-and-retry on expiry.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiResponse, AuthorizedClient};
pub use error::{RequestError, ResponseBody, TransportError};
pub use transport::{ApiRequest, HttpResponse, HttpTransport, Transport};

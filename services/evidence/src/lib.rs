//! Read-only evidence service over the batch storage root.

pub mod config;
pub mod transport;
#[cfg(feature = "async-transport")]
pub mod transport_axum;

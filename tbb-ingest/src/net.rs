//! Network ingress primitives.
//!
//! Capture threads bind one [`UdpSocket`] per configured [`Endpoint`] and
//! wait on it through mio's `Poll`.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;

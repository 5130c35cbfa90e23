//! Implementation of the Sendmail mail-filter ("milter") protocol, in both
//! roles: the MTA-side client that streams envelope and message data to a
//! filter process, and the filter-side server that dispatches those events
//! to a [`Milter`] handler and streams back modification requests.
//!
//! The protocol is binary, length-prefixed, and turn-based within a
//! connection. Speaks protocol version 2 by default and version 6 where
//! both peers advertise it.

pub mod client;
pub mod client_types;
mod codes;
mod cstrings;
mod error;
mod headers;
mod modifier;
mod packet;
pub mod server;
mod session;
pub mod traits;

pub use client::*;
pub use client_types::*;
pub use codes::*;
pub use error::*;
pub use headers::*;
pub use modifier::*;
pub use server::*;
pub use traits::*;

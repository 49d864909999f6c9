//! Core of the Aster satellite: the multi-protocol transport server and the
//! catalog iteration loop.
//!
//! Everything else in the satellite (observers, catalog storage, consoles)
//! plugs into the narrow contracts exposed here: endpoint muxes on the
//! [`server::Server`] side, [`metabase::CatalogDb`] and
//! [`metaloop::Observer`] on the loop side.

pub mod config;
pub mod identity;
pub mod log;
pub mod metabase;
pub mod metaloop;
pub mod server;
pub mod tls;

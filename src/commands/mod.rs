//! # Commands Module
//!
//! Command handlers for the synapse CLI:
//!
//! ## `send`
//! Serves a file or directory to peers on the local network:
//! - Archives directories into a temporary zip
//! - Listens over TLS on an ephemeral port and announces via mDNS
//! - Prompts for approval on each incoming connection
//! - Streams content with adaptive compression and a BLAKE3 footer
//!
//! ## `receive`
//! Downloads from a peer on the local network:
//! - Browses the service directory and offers a peer chooser
//! - Negotiates a resume offset for partially received files
//! - Verifies the footer digest and extracts directory archives

pub mod history;
pub mod receive;
pub mod send;
pub mod settings;

//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Plain listener  → tokio TcpListener   → axum::serve
//! TLS listener    → tls.rs (rustls)     → axum_server
//!     → both tag requests with ConnectionInfo for the scheme lookup
//! ```

pub mod tls;

//! Utility Functions
//!
//! ## Error Formatting
//!
//! The [`errors`] module turns host failures into user-friendly messages:
//!
//! ```rust,ignore
//! use lamco_vpn_session::utils::format_user_error;
//!
//! if let Err(e) = run().await {
//!     eprintln!("{}", format_user_error(&e));
//! }
//! ```
//!
//! Error categories with context-aware help:
//! - Engine errors → OpenVPN installation, binary path, tun privileges
//! - Store errors → state file permissions, disk space
//! - Config errors → syntax and value validation

pub mod errors;

pub use errors::format_user_error;

//! PinWallet - custodial wallets with PIN-authorized transfers
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Value & Credentials
//! - [`money`] - Fixed-point amounts in minor units
//! - [`pin`] - PIN format rules and Argon2id credential custody
//!
//! ## Ledger
//! - [`ledger`] - Wallet records, per-wallet locking, reserve/commit
//! - [`persistence`] - Storage backends (SQLite and in-memory)
//!
//! ## Transfers
//! - [`engine`] - Deposit, transfer and batch orchestration with retries
//! - [`rate_guard`] - Per-caller fixed-window throttling
//!
//! ## Integration
//! - [`api`] - REST API (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`logging`] - Tracing subscriber setup

#![forbid(unsafe_code)]

// ============================================================================
// Value & Credentials
// ============================================================================
pub mod money;
pub mod pin;

// ============================================================================
// Ledger
// ============================================================================
pub mod ledger;
pub mod persistence;

// ============================================================================
// Transfers
// ============================================================================
pub mod engine;
pub mod rate_guard;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod logging;

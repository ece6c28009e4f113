//! # NMX Core
//!
//! Primitives shared by the NMX emission schedule and staking engine.
//!
//! This crate provides:
//! - `Fixed64x64` - signed 64.64 fixed point for every rate and share
//! - `Address`, `Amount`, `Timestamp` - identities and quantities
//! - `Ledger` / `MemoryLedger` - the fungible value store the engine pays through
//! - `Ownable` - the single-owner gate
//! - typed-data authorization for relayed actions
//!
//! ## Value flow
//!
//! ```text
//!   now ──► MintSchedule ──► Nmx (5 pools) ──► StakingRouter ──► StakingService ──► stakers
//!                                   │                                   ▲
//!                                   └──────────── Ledger ───────────────┘
//! ```

pub mod access;
pub mod authorization;
pub mod error;
pub mod fixed;
pub mod ledger;
pub mod types;

pub use access::*;
pub use authorization::*;
pub use error::*;
pub use fixed::*;
pub use ledger::*;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::access::Ownable;
    pub use crate::authorization::{
        Domain, Ed25519Verifier, Nonces, SignatureVerifier, SignedAuthorization, SigningAccount,
        TypedData,
    };
    pub use crate::error::{NmxError, Result};
    pub use crate::fixed::Fixed64x64;
    pub use crate::ledger::{Ledger, MemoryLedger};
    pub use crate::types::*;
}

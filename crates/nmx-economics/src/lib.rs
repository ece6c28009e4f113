//! # NMX Economics - Emission Schedule, Staking & Referral Bonuses
//!
//! Deterministic off-chain engine for the Nominex NMX token economy.
//!
//! ## Key Features
//!
//! - **Piecewise emission**: weekly cycles with geometric decay, split across five pools
//! - **Global throttle**: owner-settable output rate in `[0, 1]`
//! - **Routing**: one upstream pool fanned out to staking services by share
//! - **Proportional staking**: rewards via a historical reward rate, O(1) per staker
//! - **Referrals**: USDT-valued thresholds pay referral and referrer bonuses
//!
//! ## Supply Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MintSchedule ──► Nmx pool cursor ──► StakingRouter ──► StakingService  │
//! │                      (primary)          (shares)         (hrr, bonus)   │
//! │                                                                         │
//! │  Nmx bonus pool ─────────── request_direct_bonus ──────► referral pair  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Default Schedule
//!
//! | Period | Weeks | Daily emission at start |
//! |--------|-------|-------------------------|
//! | First month | 4 | 10,000 NMX |
//! | Second month | 4 | ~9,763 NMX |
//! | Afterwards | 9 items over ~66 years | decaying |

pub mod bonus;
pub mod config;
pub mod context;
pub mod events;
pub mod nmx;
pub mod protocol;
pub mod recoverable;
pub mod router;
pub mod schedule;
pub mod service;
pub mod supplier;

// Re-exports
pub use bonus::{BonusConfig, DirectBonusMultiplier, ReferrerMultiplier, StakingTokenPrice};
pub use config::{ConfigError, ProtocolConfig};
pub use context::Context;
pub use events::Event;
pub use nmx::Nmx;
pub use protocol::{Operation, Protocol, Scenario, SharedProtocol, Step, StepOutcome};
pub use recoverable::Recoverable;
pub use router::{RoutedSupplier, StakingRouter};
pub use schedule::{MintPool, MintSchedule, ScheduleItem, ScheduleState, POOL_COUNT};
pub use service::{ServiceState, Staker, StakingService};
pub use supplier::{FixedRateSupplier, NmxSupplier};

/// NMX token constants
pub mod constants {
    /// Token symbol
    pub const SYMBOL: &str = "NMX";

    /// Token name
    pub const NAME: &str = "Nominex";

    pub const DECIMALS: u8 = 18;

    /// One NMX in smallest unit
    pub const ONE_NMX: u128 = 1_000_000_000_000_000_000; // 10^18

    /// Hard cap of all pools together
    pub const MAX_SUPPLY: u128 = 200_000_000 * ONE_NMX;

    pub const SECONDS_PER_DAY: u64 = 24 * 3600;

    pub const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;

    /// Denominator of referral multipliers
    pub const BASIS_POINTS: u128 = 10_000;

    /// Referral multiplier of a freshly deployed service (5%)
    pub const DEFAULT_REFERRAL_MULTIPLIER: u16 = 500;
}

pub use constants::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(ONE_NMX, 10u128.pow(DECIMALS as u32));
        assert_eq!(SECONDS_PER_WEEK, 604_800);
        assert!(u128::from(DEFAULT_REFERRAL_MULTIPLIER) < BASIS_POINTS);
    }

    #[test]
    fn test_default_schedule_starts_at_ten_thousand_per_day() {
        let schedule = MintSchedule::nominex_default(nmx_core::Address::from_label("owner"));
        let state = schedule.initial_state(0);
        let daily = state.next_tick_supply * SECONDS_PER_DAY as u128;
        assert!(daily <= 10_000 * ONE_NMX);
        assert!(10_000 * ONE_NMX - daily < ONE_NMX);
    }
}

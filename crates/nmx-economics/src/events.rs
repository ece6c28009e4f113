//! Events appended to the protocol log by successful operations

use nmx_core::{Address, Amount, Fixed64x64, TokenId};
use serde::{Deserialize, Serialize};

use crate::schedule::MintPool;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    // === Staking service ===
    Staked {
        service: Address,
        owner: Address,
        amount: Amount,
    },
    Unstaked {
        service: Address,
        from: Address,
        to: Address,
        amount: Amount,
    },
    Rewarded {
        service: Address,
        from: Address,
        to: Address,
        amount: Amount,
    },
    StakingBonusAccrued {
        service: Address,
        staker: Address,
        amount: Amount,
    },
    ReferralBonusAccrued {
        service: Address,
        referral: Address,
        amount: Amount,
    },
    ReferrerBonusAccrued {
        service: Address,
        referrer: Address,
        amount: Amount,
    },
    ReferrerChanged {
        service: Address,
        referral: Address,
        referrer: Address,
    },
    HistoricalRewardRateUpdated {
        service: Address,
        old_rate: Fixed64x64,
        new_rate: Fixed64x64,
    },
    NmxSupplierChanged {
        service: Address,
        supplier: Address,
    },
    Paused {
        contract: Address,
    },
    Unpaused {
        contract: Address,
    },
    ClaimRewardPaused {
        service: Address,
    },
    ClaimRewardUnpaused {
        service: Address,
    },

    // === Emission ===
    PoolOwnershipTransferred {
        pool: MintPool,
        previous_owner: Address,
        new_owner: Address,
    },
    NmxSupplied {
        supplier: Address,
        to: Address,
        amount: Amount,
    },
    DirectBonusPaid {
        supplier: Address,
        to: Address,
        amount: Amount,
    },
    OutputRateChanged {
        rate: Fixed64x64,
    },
    ScheduleReplaced {
        items: usize,
    },
    StakingServiceSharesChanged {
        router: Address,
        services: Vec<Address>,
        shares: Vec<Fixed64x64>,
    },

    // === Ownership ===
    OwnershipTransferred {
        contract: Address,
        previous_owner: Address,
        new_owner: Address,
    },

    // === Recovery ===
    FundsRecovered {
        contract: Address,
        token: TokenId,
        to: Address,
        amount: Amount,
    },
}

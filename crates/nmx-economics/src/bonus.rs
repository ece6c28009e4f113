//! # Referral Bonus Tables
//!
//! A staker with a referrer earns a referral bonus on top of its staking bonus, and
//! the referrer earns a referrer bonus. The referrer's tier is chosen by the USDT value
//! of what the referrer itself has staked.
//!
//! | Referrer staked (USDT) | Referrer multiplier |
//! |------------------------|---------------------|
//! | >= 100 | 5% |
//! | >= 300 | 10% |
//! | >= 1,000 | 15% |
//! | >= 3,000 | 20% |
//! | >= 10,000 | 25% |
//!
//! All multipliers are basis points of the staking bonus.

use nmx_core::{amount_serde, Amount, Fixed64x64, NmxError, Result};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::constants::{BASIS_POINTS, DEFAULT_REFERRAL_MULTIPLIER};

/// Row of a threshold table keyed by staked value in whole USDT
pub trait Threshold {
    fn staked_amount_in_usdt(&self) -> u128;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferrerMultiplier {
    #[serde(with = "amount_serde")]
    pub staked_amount_in_usdt: u128,
    pub multiplier: u16,
}

impl Threshold for ReferrerMultiplier {
    fn staked_amount_in_usdt(&self) -> u128 {
        self.staked_amount_in_usdt
    }
}

/// Tier that sets both sides of the referral at once
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectBonusMultiplier {
    #[serde(with = "amount_serde")]
    pub staked_amount_in_usdt: u128,
    pub referrer: u16,
    pub referral: u16,
}

impl Threshold for DirectBonusMultiplier {
    fn staked_amount_in_usdt(&self) -> u128 {
        self.staked_amount_in_usdt
    }
}

/// Thresholds must be strictly increasing
pub fn validate_order<T: Threshold>(table: &[T]) -> Result<()> {
    let increasing = table
        .windows(2)
        .all(|pair| pair[0].staked_amount_in_usdt() < pair[1].staked_amount_in_usdt());
    if increasing {
        Ok(())
    } else {
        Err(NmxError::InvalidOrder)
    }
}

/// Greatest row whose threshold is `<= value`
pub fn lookup<T: Threshold>(table: &[T], value: u128) -> Option<&T> {
    let idx = table.partition_point(|row| row.staked_amount_in_usdt() <= value);
    idx.checked_sub(1).map(|i| &table[i])
}

/// USDT valuation of the staking token
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakingTokenPrice {
    /// No price source; every stake is worth 0 USDT
    #[default]
    Unpriced,
    /// Constant USDT price of one whole token
    Fixed {
        usdt_per_token: Fixed64x64,
        token_decimals: u8,
    },
    /// Liquidity token of a USDT pair, worth twice its share of the USDT reserve
    UniswapPair {
        #[serde(with = "amount_serde")]
        usdt_reserve: Amount,
        #[serde(with = "amount_serde")]
        lp_total_supply: Amount,
        usdt_decimals: u8,
    },
}

impl StakingTokenPrice {
    /// Whole USDT value of `amount` staking-token units
    pub fn usdt_value(&self, amount: Amount) -> Result<u128> {
        match self {
            Self::Unpriced => Ok(0),
            Self::Fixed {
                usdt_per_token,
                token_decimals,
            } => Ok(usdt_per_token.mulu(amount)? / pow10(*token_decimals)?),
            Self::UniswapPair {
                usdt_reserve,
                lp_total_supply,
                usdt_decimals,
            } => {
                if *lp_total_supply == 0 {
                    return Ok(0);
                }
                let value = U256::from(amount)
                    .checked_mul(U256::from(*usdt_reserve))
                    .and_then(|v| v.checked_mul(U256::from(2u8)))
                    .ok_or(NmxError::ArithmeticOverflow)?
                    / U256::from(*lp_total_supply)
                    / U256::from(pow10(*usdt_decimals)?);
                if value > U256::from(u128::MAX) {
                    return Err(NmxError::ArithmeticOverflow);
                }
                Ok(value.as_u128())
            }
        }
    }
}

fn pow10(decimals: u8) -> Result<u128> {
    10u128
        .checked_pow(decimals as u32)
        .ok_or(NmxError::ArithmeticOverflow)
}

fn default_referral_multiplier() -> u16 {
    DEFAULT_REFERRAL_MULTIPLIER
}

fn default_referrer_multipliers() -> Vec<ReferrerMultiplier> {
    [(100, 500), (300, 1000), (1000, 1500), (3000, 2000), (10000, 2500)]
        .into_iter()
        .map(|(staked_amount_in_usdt, multiplier)| ReferrerMultiplier {
            staked_amount_in_usdt,
            multiplier,
        })
        .collect()
}

/// Bonus settings of one staking service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusConfig {
    #[serde(default = "default_referral_multiplier")]
    pub referral_multiplier: u16,

    #[serde(default = "default_referrer_multipliers")]
    pub referrer_multipliers: Vec<ReferrerMultiplier>,

    /// When non-empty, supplies both multipliers and overrides the two settings above
    #[serde(default)]
    pub direct_bonus_multipliers: Vec<DirectBonusMultiplier>,

    #[serde(default)]
    pub staking_token_price: StakingTokenPrice,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            referral_multiplier: default_referral_multiplier(),
            referrer_multipliers: default_referrer_multipliers(),
            direct_bonus_multipliers: Vec::new(),
            staking_token_price: StakingTokenPrice::default(),
        }
    }
}

impl BonusConfig {
    pub fn validate(&self) -> Result<()> {
        validate_order(&self.referrer_multipliers)?;
        validate_order(&self.direct_bonus_multipliers)
    }

    /// `(referral, referrer)` multipliers for a referrer holding `referrer_value` USDT of stake
    pub fn multipliers(&self, referrer_value: u128) -> (u16, u16) {
        if !self.direct_bonus_multipliers.is_empty() {
            return lookup(&self.direct_bonus_multipliers, referrer_value)
                .map(|row| (row.referral, row.referrer))
                .unwrap_or((0, 0));
        }
        let referrer = lookup(&self.referrer_multipliers, referrer_value)
            .map(|row| row.multiplier)
            .unwrap_or(0);
        (self.referral_multiplier, referrer)
    }
}

/// `amount * multiplier / 10000`, floored
pub fn apply_multiplier(amount: Amount, multiplier: u16) -> Result<Amount> {
    amount
        .checked_mul(multiplier as u128)
        .map(|v| v / BASIS_POINTS)
        .ok_or(NmxError::ArithmeticOverflow)
}

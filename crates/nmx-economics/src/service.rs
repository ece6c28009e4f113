//! # Staking Service
//!
//! Stakers lock a staking token and earn NMX in proportion to their stake. Rewards
//! use a historical reward rate: every pull of new supply raises the rate by
//! `received / total_staked`, and each staker catches up on its own next interaction
//! with `amount * (rate - snapshot)`. No operation iterates over stakers.
//!
//! ```text
//!   supplier ──supply_nmx──► hrr += received / total_staked
//!                                 │
//!   staker  ──stake/unstake/claim──► reward += amount * (hrr - snapshot)
//!                                 │
//!                       referrer? └──► direct bonus for referral + referrer
//! ```
//!
//! `paused` blocks only staking; unstaking and claiming always stay open.
//! `claim_reward_paused` blocks only claiming.

use nmx_core::{
    amount_serde, Address, Amount, ChainId, Domain, Fixed64x64, Ledger, NmxError, Nonces,
    Ownable, Result, SignatureVerifier, SignedAuthorization, Timestamp, TokenId, TypedData,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::bonus::{
    apply_multiplier, validate_order, BonusConfig, DirectBonusMultiplier, ReferrerMultiplier,
    StakingTokenPrice,
};
use crate::context::Context;
use crate::events::Event;
use crate::recoverable::Recoverable;
use crate::supplier::NmxSupplier;

/// Domain name of typed-data authorizations addressed to a staking service
pub const DOMAIN_NAME: &str = "StakingService";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staker {
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    /// Historical reward rate at the staker's last sync
    pub initial_reward_rate: Fixed64x64,
    /// Accrued and unclaimed NMX
    #[serde(with = "amount_serde")]
    pub reward: Amount,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(with = "amount_serde")]
    pub total_staked: Amount,
    pub historical_reward_rate: Fixed64x64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingService {
    address: Address,
    owner: Ownable,
    nmx: TokenId,
    staking_token: TokenId,
    nmx_supplier: Address,
    chain_id: ChainId,
    state: ServiceState,
    stakers: BTreeMap<Address, Staker>,
    /// referral -> referrer
    referrers: BTreeMap<Address, Address>,
    bonus: BonusConfig,
    paused: bool,
    claim_reward_paused: bool,
    nonces: Nonces,
}

impl StakingService {
    pub fn new(
        address: Address,
        owner: Address,
        nmx: TokenId,
        staking_token: TokenId,
        nmx_supplier: Address,
        chain_id: ChainId,
    ) -> Self {
        Self {
            address,
            owner: Ownable::new(owner),
            nmx,
            staking_token,
            nmx_supplier,
            chain_id,
            state: ServiceState::default(),
            stakers: BTreeMap::new(),
            referrers: BTreeMap::new(),
            bonus: BonusConfig::default(),
            paused: false,
            claim_reward_paused: false,
            nonces: Nonces::default(),
        }
    }

    /// Replace the bonus settings at deployment
    pub fn with_bonus(mut self, bonus: BonusConfig) -> Result<Self> {
        bonus.validate()?;
        self.bonus = bonus;
        Ok(self)
    }

    // === Queries ===

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner.owner()
    }

    pub fn nmx_supplier(&self) -> Address {
        self.nmx_supplier
    }

    pub fn staking_token(&self) -> TokenId {
        self.staking_token
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn staker(&self, owner: &Address) -> Staker {
        self.stakers.get(owner).cloned().unwrap_or_default()
    }

    pub fn stakers(&self) -> impl Iterator<Item = (&Address, &Staker)> {
        self.stakers.iter()
    }

    pub fn referrer(&self, referral: &Address) -> Option<Address> {
        self.referrers.get(referral).copied()
    }

    pub fn bonus(&self) -> &BonusConfig {
        &self.bonus
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_claim_reward_paused(&self) -> bool {
        self.claim_reward_paused
    }

    pub fn nonce(&self, owner: &Address) -> u64 {
        self.nonces.current(owner)
    }

    pub fn domain(&self) -> Domain {
        Domain::new(DOMAIN_NAME, self.chain_id, self.address)
    }

    fn staker_mut(&mut self, owner: Address) -> &mut Staker {
        self.stakers.entry(owner).or_default()
    }

    // === Reward accrual ===

    /// Pull new supply and spread it over the current stake
    pub fn update_historical_reward_rate(
        &mut self,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let received = supplier.supply_nmx(self.address, ctx.now, ctx)?;
        if received == 0 {
            return Ok(());
        }
        if self.state.total_staked == 0 {
            let owner = self.owner.owner();
            ctx.ledger.transfer(self.nmx, self.address, owner, received)?;
            debug!(service = %self.address, received, "nothing staked, supply sent to owner");
            return Ok(());
        }

        let old_rate = self.state.historical_reward_rate;
        let new_rate =
            old_rate.checked_add(Fixed64x64::from_ratio(received, self.state.total_staked)?)?;
        self.state.historical_reward_rate = new_rate;
        ctx.emit(Event::HistoricalRewardRateUpdated {
            service: self.address,
            old_rate,
            new_rate,
        });
        Ok(())
    }

    /// Bring one staker up to the current rate, paying referral bonuses if any
    fn update_staker(
        &mut self,
        owner: Address,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let rate = self.state.historical_reward_rate;
        let staker = self.staker_mut(owner);
        let staking_bonus = rate
            .checked_sub(staker.initial_reward_rate)?
            .mulu(staker.amount)?;
        staker.initial_reward_rate = rate;
        staker.reward = staker
            .reward
            .checked_add(staking_bonus)
            .ok_or(NmxError::ArithmeticOverflow)?;
        ctx.emit(Event::StakingBonusAccrued {
            service: self.address,
            staker: owner,
            amount: staking_bonus,
        });

        if staking_bonus == 0 {
            return Ok(());
        }
        let Some(referrer) = self.referrer(&owner) else {
            return Ok(());
        };

        let referrer_value = self
            .bonus
            .staking_token_price
            .usdt_value(self.staker(&referrer).amount)?;
        let (referral_multiplier, referrer_multiplier) = self.bonus.multipliers(referrer_value);
        let referral_bonus = apply_multiplier(staking_bonus, referral_multiplier)?;
        let referrer_bonus = apply_multiplier(staking_bonus, referrer_multiplier)?;
        let requested = referral_bonus
            .checked_add(referrer_bonus)
            .ok_or(NmxError::ArithmeticOverflow)?;

        let paid = if requested > 0 {
            supplier.request_direct_bonus(self.address, requested, ctx)?
        } else {
            0
        };
        // referrer first, the referral gets what is left
        let referrer_paid = referrer_bonus.min(paid);
        let referral_paid = referral_bonus.min(paid - referrer_paid);

        let entry = self.staker_mut(referrer);
        entry.reward = entry
            .reward
            .checked_add(referrer_paid)
            .ok_or(NmxError::ArithmeticOverflow)?;
        let entry = self.staker_mut(owner);
        entry.reward = entry
            .reward
            .checked_add(referral_paid)
            .ok_or(NmxError::ArithmeticOverflow)?;

        debug!(
            service = %self.address,
            %owner,
            %referrer,
            staking_bonus,
            requested,
            paid,
            "referral bonuses accrued"
        );
        ctx.emit(Event::ReferralBonusAccrued {
            service: self.address,
            referral: owner,
            amount: referral_paid,
        });
        ctx.emit(Event::ReferrerBonusAccrued {
            service: self.address,
            referrer,
            amount: referrer_paid,
        });
        Ok(())
    }

    fn sync(&mut self, owner: Address, supplier: &mut dyn NmxSupplier, ctx: &mut Context<'_>) -> Result<()> {
        self.update_historical_reward_rate(supplier, ctx)?;
        self.update_staker(owner, supplier, ctx)
    }

    /// Sync `owner` and return its unclaimed reward
    pub fn get_reward(
        &mut self,
        owner: Address,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        self.sync(owner, supplier, ctx)?;
        Ok(self.staker(&owner).reward)
    }

    // === Staking ===

    pub fn stake(
        &mut self,
        caller: Address,
        amount: Amount,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        self.stake_from(caller, amount, supplier, ctx)
    }

    /// Stake on behalf of `owner`, pulling the tokens from `owner` under its allowance
    pub fn stake_from(
        &mut self,
        owner: Address,
        amount: Amount,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        if self.paused {
            return Err(NmxError::Paused);
        }
        self.sync(owner, supplier, ctx)?;
        ctx.ledger
            .transfer_from(self.staking_token, self.address, owner, self.address, amount)?;

        let staker = self.staker_mut(owner);
        staker.amount = staker
            .amount
            .checked_add(amount)
            .ok_or(NmxError::ArithmeticOverflow)?;
        self.state.total_staked = self
            .state
            .total_staked
            .checked_add(amount)
            .ok_or(NmxError::ArithmeticOverflow)?;

        debug!(service = %self.address, %owner, amount, total = self.state.total_staked, "staked");
        ctx.emit(Event::Staked {
            service: self.address,
            owner,
            amount,
        });
        Ok(())
    }

    /// Approve through a signed permit on the staking token, then stake
    #[allow(clippy::too_many_arguments)]
    pub fn stake_with_permit(
        &mut self,
        owner: Address,
        amount: Amount,
        deadline: Timestamp,
        authorization: &SignedAuthorization,
        verifier: &dyn SignatureVerifier,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        if self.paused {
            return Err(NmxError::Paused);
        }
        ctx.ledger.permit(
            verifier,
            self.chain_id,
            self.staking_token,
            owner,
            self.address,
            amount,
            deadline,
            authorization,
            ctx.now,
        )?;
        self.stake_from(owner, amount, supplier, ctx)
    }

    pub fn unstake(
        &mut self,
        caller: Address,
        amount: Amount,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        self.unstake_to(caller, caller, amount, supplier, ctx)
    }

    /// Withdraw `amount` of `owner`'s stake to `to`. Open while paused.
    pub fn unstake_to(
        &mut self,
        owner: Address,
        to: Address,
        amount: Amount,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        if amount > self.staker(&owner).amount {
            return Err(NmxError::NotEnoughStaked);
        }
        self.sync(owner, supplier, ctx)?;
        ctx.ledger.transfer(self.staking_token, self.address, to, amount)?;

        let staker = self.staker_mut(owner);
        staker.amount -= amount;
        self.state.total_staked -= amount;

        debug!(service = %self.address, %owner, %to, amount, total = self.state.total_staked, "unstaked");
        ctx.emit(Event::Unstaked {
            service: self.address,
            from: owner,
            to,
            amount,
        });
        Ok(())
    }

    /// Unstake signed by `owner` and relayed by `spender`, who receives the tokens
    #[allow(clippy::too_many_arguments)]
    pub fn unstake_with_authorization(
        &mut self,
        spender: Address,
        owner: Address,
        amount: Amount,
        sign_amount: Amount,
        deadline: Timestamp,
        authorization: &SignedAuthorization,
        verifier: &dyn SignatureVerifier,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        if sign_amount < amount {
            return Err(NmxError::InvalidAmount);
        }
        let data = TypedData::Unstake {
            owner,
            spender,
            value: sign_amount,
            nonce: self.nonces.current(&owner),
            deadline,
        };
        let domain = self.domain();
        self.nonces
            .verify_and_use(verifier, &domain, &data, authorization, ctx.now)?;
        self.unstake_to(owner, spender, amount, supplier, ctx)
    }

    // === Claiming ===

    pub fn claim_reward(
        &mut self,
        caller: Address,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        self.claim_reward_to(caller, caller, supplier, ctx)
    }

    /// Sync and pay the whole unclaimed reward of `owner` to `to`
    pub fn claim_reward_to(
        &mut self,
        owner: Address,
        to: Address,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        if self.claim_reward_paused {
            return Err(NmxError::ClaimRewardPaused);
        }
        self.sync(owner, supplier, ctx)?;
        self.pay_reward(owner, to, None, ctx)
    }

    /// Claim against the current rate without pulling new supply, for when the
    /// supplier cannot be reached
    pub fn claim_reward_to_without_update(
        &mut self,
        owner: Address,
        to: Address,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        if self.claim_reward_paused {
            return Err(NmxError::ClaimRewardPaused);
        }
        self.update_staker(owner, supplier, ctx)?;
        self.pay_reward(owner, to, None, ctx)
    }

    /// Claim signed by `owner` and relayed by `spender`, who receives `nmx_amount`.
    /// `sign_amount` is an upper bound on what the signature allows.
    #[allow(clippy::too_many_arguments)]
    pub fn claim_with_authorization(
        &mut self,
        spender: Address,
        owner: Address,
        nmx_amount: Amount,
        sign_amount: Amount,
        deadline: Timestamp,
        authorization: &SignedAuthorization,
        verifier: &dyn SignatureVerifier,
        supplier: &mut dyn NmxSupplier,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        if self.claim_reward_paused {
            return Err(NmxError::ClaimRewardPaused);
        }
        if sign_amount < nmx_amount {
            return Err(NmxError::InvalidNmxAmount);
        }
        let data = TypedData::Claim {
            owner,
            spender,
            value: sign_amount,
            nonce: self.nonces.current(&owner),
            deadline,
        };
        let domain = self.domain();
        self.nonces
            .verify_and_use(verifier, &domain, &data, authorization, ctx.now)?;

        self.sync(owner, supplier, ctx)?;
        self.pay_reward(owner, spender, Some(nmx_amount), ctx)
    }

    /// Pay `amount` (everything when `None`) of `owner`'s reward to `to`
    fn pay_reward(
        &mut self,
        owner: Address,
        to: Address,
        amount: Option<Amount>,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        let staker = self.staker_mut(owner);
        let amount = amount.unwrap_or(staker.reward);
        if amount > staker.reward {
            return Err(NmxError::NotEnoughBalance);
        }
        staker.reward -= amount;
        if amount > 0 {
            ctx.ledger.transfer(self.nmx, self.address, to, amount)?;
        }
        debug!(service = %self.address, %owner, %to, amount, "rewarded");
        ctx.emit(Event::Rewarded {
            service: self.address,
            from: owner,
            to,
            amount,
        });
        Ok(amount)
    }

    // === Referrals ===

    /// Assign `referrer` to `referral`, once and for good
    pub fn set_referrer(&mut self, referral: Address, referrer: Address, ctx: &mut Context<'_>) -> Result<()> {
        if referrer.is_zero() || referrer == referral || self.referrers.contains_key(&referral) {
            return Err(NmxError::InvalidReferrer);
        }
        self.referrers.insert(referral, referrer);
        debug!(service = %self.address, %referral, %referrer, "referrer set");
        ctx.emit(Event::ReferrerChanged {
            service: self.address,
            referral,
            referrer,
        });
        Ok(())
    }

    pub fn set_referrer_with_authorization(
        &mut self,
        owner: Address,
        referrer: Address,
        deadline: Timestamp,
        authorization: &SignedAuthorization,
        verifier: &dyn SignatureVerifier,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let data = TypedData::SetReferrer {
            owner,
            referrer,
            nonce: self.nonces.current(&owner),
            deadline,
        };
        let domain = self.domain();
        self.nonces
            .verify_and_use(verifier, &domain, &data, authorization, ctx.now)?;
        self.set_referrer(owner, referrer, ctx)
    }

    // === Owner operations ===

    pub fn set_referral_multiplier(&mut self, caller: &Address, multiplier: u16) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        info!(service = %self.address, multiplier, "referral multiplier changed");
        self.bonus.referral_multiplier = multiplier;
        Ok(())
    }

    pub fn set_referrer_multipliers(
        &mut self,
        caller: &Address,
        multipliers: Vec<ReferrerMultiplier>,
    ) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        validate_order(&multipliers)?;
        info!(service = %self.address, tiers = multipliers.len(), "referrer multipliers changed");
        self.bonus.referrer_multipliers = multipliers;
        Ok(())
    }

    pub fn set_direct_bonus_multipliers(
        &mut self,
        caller: &Address,
        multipliers: Vec<DirectBonusMultiplier>,
    ) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        validate_order(&multipliers)?;
        info!(service = %self.address, tiers = multipliers.len(), "direct bonus multipliers changed");
        self.bonus.direct_bonus_multipliers = multipliers;
        Ok(())
    }

    pub fn set_staking_token_price(&mut self, caller: &Address, price: StakingTokenPrice) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        self.bonus.staking_token_price = price;
        Ok(())
    }

    pub fn change_nmx_supplier(&mut self, caller: &Address, supplier: Address, ctx: &mut Context<'_>) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        info!(service = %self.address, %supplier, "nmx supplier changed");
        self.nmx_supplier = supplier;
        ctx.emit(Event::NmxSupplierChanged {
            service: self.address,
            supplier,
        });
        Ok(())
    }

    pub fn pause(&mut self, caller: &Address, ctx: &mut Context<'_>) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        if self.paused {
            return Err(NmxError::Paused);
        }
        self.paused = true;
        info!(service = %self.address, "paused");
        ctx.emit(Event::Paused {
            contract: self.address,
        });
        Ok(())
    }

    pub fn unpause(&mut self, caller: &Address, ctx: &mut Context<'_>) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        if !self.paused {
            return Err(NmxError::NotPaused);
        }
        self.paused = false;
        info!(service = %self.address, "unpaused");
        ctx.emit(Event::Unpaused {
            contract: self.address,
        });
        Ok(())
    }

    pub fn pause_claim_reward(&mut self, caller: &Address, ctx: &mut Context<'_>) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        self.claim_reward_paused = true;
        info!(service = %self.address, "claim reward paused");
        ctx.emit(Event::ClaimRewardPaused {
            service: self.address,
        });
        Ok(())
    }

    pub fn unpause_claim_reward(&mut self, caller: &Address, ctx: &mut Context<'_>) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        self.claim_reward_paused = false;
        info!(service = %self.address, "claim reward unpaused");
        ctx.emit(Event::ClaimRewardUnpaused {
            service: self.address,
        });
        Ok(())
    }

    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<()> {
        self.owner.transfer_ownership(caller, new_owner)
    }
}

impl Recoverable for StakingService {
    fn contract_address(&self) -> Address {
        self.address
    }

    fn contract_owner(&self) -> Address {
        self.owner.owner()
    }

    fn recoverable_amount(&self, token: TokenId, ledger: &dyn Ledger) -> Result<Amount> {
        if token == self.nmx {
            return Err(NmxError::InvalidRecoverableToken);
        }
        let balance = ledger.balance_of(token, self.address);
        if token == self.staking_token {
            return Ok(balance.saturating_sub(self.state.total_staked));
        }
        Ok(balance)
    }
}

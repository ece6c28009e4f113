//! # Nmx Token
//!
//! The token contract owns the schedule and five independent pool cursors. Each pool
//! has at most one owner; pulling NMX mints the caller's pool emission to the caller.
//!
//! | Pool | Typical owner |
//! |------|---------------|
//! | primary | staking router |
//! | bonus | left unowned, feeds direct referral bonuses |
//! | team | team multisig |
//! | nominex | operational fund |

use nmx_core::{amount_serde, Address, Amount, Fixed64x64, Ledger, NmxError, Ownable, Result, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::Context;
use crate::events::Event;
use crate::recoverable::Recoverable;
use crate::schedule::{MintPool, MintSchedule, ScheduleItem, ScheduleState, POOL_COUNT};
use crate::supplier::NmxSupplier;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nmx {
    address: TokenId,
    owner: Ownable,
    schedule: MintSchedule,
    pool_owners: [Address; POOL_COUNT],
    pool_states: [ScheduleState; POOL_COUNT],
    /// Bonus-pool emission accrued for direct bonuses and not yet paid
    #[serde(with = "amount_serde")]
    bonus_reserve: Amount,
}

impl Nmx {
    /// Token with every pool cursor at `distribution_start`
    pub fn new(address: TokenId, owner: Address, schedule: MintSchedule, distribution_start: Timestamp) -> Self {
        let start = schedule.initial_state(distribution_start);
        Self {
            address,
            owner: Ownable::new(owner),
            schedule,
            pool_owners: [Address::ZERO; POOL_COUNT],
            pool_states: std::array::from_fn(|_| start.clone()),
            bonus_reserve: 0,
        }
    }

    pub fn address(&self) -> TokenId {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner.owner()
    }

    /// Hands over the token and its schedule together
    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<()> {
        self.owner.transfer_ownership(caller, new_owner)?;
        self.schedule.transfer_ownership(caller, new_owner)
    }

    pub fn schedule(&self) -> &MintSchedule {
        &self.schedule
    }

    pub fn pool_state(&self, pool: MintPool) -> &ScheduleState {
        &self.pool_states[pool.index()]
    }

    pub fn pool_owner(&self, pool: MintPool) -> Option<Address> {
        let owner = self.pool_owners[pool.index()];
        (!owner.is_zero()).then_some(owner)
    }

    pub fn bonus_reserve(&self) -> Amount {
        self.bonus_reserve
    }

    fn pool_of(&self, holder: &Address) -> Option<MintPool> {
        if holder.is_zero() {
            return None;
        }
        MintPool::ALL
            .into_iter()
            .find(|pool| self.pool_owners[pool.index()] == *holder)
    }

    pub fn transfer_pool_ownership(
        &mut self,
        caller: &Address,
        pool: MintPool,
        new_owner: Address,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        if pool == MintPool::Default {
            return Err(NmxError::InvalidPool(pool as u8));
        }
        let current = self.pool_owners[pool.index()];
        if *caller != current && !self.owner.is_owner(caller) {
            return Err(NmxError::PoolPermissionDenied);
        }
        if new_owner == current {
            return Err(NmxError::SamePoolOwner);
        }
        if self.pool_of(&new_owner).is_some() {
            return Err(NmxError::PoolOwnerNotDedicated);
        }

        self.pool_owners[pool.index()] = new_owner;
        info!(%pool, from = %current, to = %new_owner, "pool ownership transferred");
        ctx.emit(Event::PoolOwnershipTransferred {
            pool,
            previous_owner: current,
            new_owner,
        });
        Ok(())
    }

    pub fn set_output_rate(&mut self, caller: &Address, rate: Fixed64x64, ctx: &mut Context<'_>) -> Result<()> {
        self.schedule.set_output_rate(caller, rate)?;
        ctx.emit(Event::OutputRateChanged { rate });
        Ok(())
    }

    /// Replace the schedule and restart every pool cursor at `now`
    pub fn set_schedule_items(
        &mut self,
        caller: &Address,
        items: Vec<ScheduleItem>,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        let count = items.len();
        self.schedule.set_items(caller, items)?;
        let start = self.schedule.initial_state(ctx.now);
        self.pool_states = std::array::from_fn(|_| start.clone());
        ctx.emit(Event::ScheduleReplaced { items: count });
        Ok(())
    }

    /// Current per-tick emission of the primary pool
    pub fn reward_rate(&self) -> Result<Amount> {
        self.schedule
            .tick_supply(self.pool_state(MintPool::Primary), MintPool::Primary)
    }

    /// Advance a pool cursor and return its emission, without minting
    fn progress(&mut self, pool: MintPool, time: Timestamp) -> Result<Amount> {
        let (emitted, state) = self
            .schedule
            .make_progress(&self.pool_states[pool.index()], time, pool)?;
        self.pool_states[pool.index()] = state;
        Ok(emitted)
    }
}

impl NmxSupplier for Nmx {
    fn supplier_address(&self) -> Address {
        self.address
    }

    fn supply_nmx(
        &mut self,
        caller: Address,
        max_time: Timestamp,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        let Some(pool) = self.pool_of(&caller) else {
            return Ok(0);
        };
        let amount = self.progress(pool, max_time.min(ctx.now))?;
        if amount > 0 {
            ctx.ledger.mint(self.address, caller, amount)?;
        }
        debug!(%pool, %caller, amount, "nmx supplied");
        ctx.emit(Event::NmxSupplied {
            supplier: self.address,
            to: caller,
            amount,
        });
        Ok(amount)
    }

    /// Only the primary pool owner may draw on the bonus reserve
    fn request_direct_bonus(
        &mut self,
        caller: Address,
        amount: Amount,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        if self.pool_owner(MintPool::Primary) != Some(caller) {
            return Ok(0);
        }
        let accrued = self.progress(MintPool::Bonus, ctx.now)?;
        self.bonus_reserve = self
            .bonus_reserve
            .checked_add(accrued)
            .ok_or(NmxError::ArithmeticOverflow)?;

        let paid = amount.min(self.bonus_reserve);
        if paid > 0 {
            self.bonus_reserve -= paid;
            ctx.ledger.mint(self.address, caller, paid)?;
            ctx.emit(Event::DirectBonusPaid {
                supplier: self.address,
                to: caller,
                amount: paid,
            });
        }
        Ok(paid)
    }
}

impl Recoverable for Nmx {
    fn contract_address(&self) -> Address {
        self.address
    }

    fn contract_owner(&self) -> Address {
        self.owner.owner()
    }

    fn recoverable_amount(&self, token: TokenId, ledger: &dyn Ledger) -> Result<Amount> {
        Ok(ledger.balance_of(token, self.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SECONDS_PER_DAY;
    use nmx_core::MemoryLedger;

    struct Fixture {
        nmx: Nmx,
        ledger: MemoryLedger,
        events: Vec<Event>,
        owner: Address,
    }

    impl Fixture {
        fn new() -> Self {
            let owner = Address::from_label("owner");
            let schedule = MintSchedule::nominex_default(owner);
            Self {
                nmx: Nmx::new(Address::from_label("nmx"), owner, schedule, 0),
                ledger: MemoryLedger::new(),
                events: Vec::new(),
                owner,
            }
        }

        fn transfer(&mut self, caller: &Address, pool: MintPool, to: Address) -> Result<()> {
            let mut ctx = Context::new(0, &mut self.ledger, &mut self.events);
            self.nmx.transfer_pool_ownership(caller, pool, to, &mut ctx)
        }

        fn supply(&mut self, caller: Address, now: Timestamp) -> Amount {
            let mut ctx = Context::new(now, &mut self.ledger, &mut self.events);
            self.nmx.supply_nmx(caller, u64::MAX, &mut ctx).unwrap()
        }
    }

    #[test]
    fn test_pool_ownership_rules() {
        let mut f = Fixture::new();
        let owner = f.owner;
        let a = Address::from_label("a");
        let b = Address::from_label("b");

        f.transfer(&owner, MintPool::Primary, a).unwrap();
        assert_eq!(f.nmx.pool_owner(MintPool::Primary), Some(a));

        assert_eq!(f.transfer(&owner, MintPool::Primary, a), Err(NmxError::SamePoolOwner));
        assert_eq!(f.transfer(&b, MintPool::Primary, b), Err(NmxError::PoolPermissionDenied));
        assert_eq!(f.transfer(&owner, MintPool::Team, a), Err(NmxError::PoolOwnerNotDedicated));
        assert_eq!(
            f.transfer(&owner, MintPool::Default, b),
            Err(NmxError::InvalidPool(0))
        );

        // the current pool owner may hand it on
        f.transfer(&a, MintPool::Primary, b).unwrap();
        assert_eq!(f.nmx.pool_owner(MintPool::Primary), Some(b));
    }

    #[test]
    fn test_supply_by_non_owner_is_zero() {
        let mut f = Fixture::new();
        assert_eq!(f.supply(Address::from_label("nobody"), SECONDS_PER_DAY), 0);
        assert_eq!(f.nmx.pool_state(MintPool::Primary).time, 0);
    }

    #[test]
    fn test_pools_progress_independently() {
        let mut f = Fixture::new();
        let owner = f.owner;
        let primary = Address::from_label("router");
        let team = Address::from_label("team");
        f.transfer(&owner, MintPool::Primary, primary).unwrap();
        f.transfer(&owner, MintPool::Team, team).unwrap();

        let supplied = f.supply(primary, 10);
        let expected = f.nmx.schedule().make_progress(&f.nmx.schedule().initial_state(0), 10, MintPool::Primary).unwrap().0;
        assert_eq!(supplied, expected);
        assert_eq!(f.ledger.balance_of(f.nmx.address(), primary), supplied);
        assert_eq!(f.nmx.pool_state(MintPool::Primary).time, 10);
        assert_eq!(f.nmx.pool_state(MintPool::Team).time, 0);

        assert_eq!(f.supply(primary, 10), 0);
        assert!(f.supply(team, 20) > 0);
    }

    #[test]
    fn test_reward_rate_tracks_primary_pool() {
        let f = Fixture::new();
        let initial = f.nmx.schedule().initial_state(0).next_tick_supply;
        let rate = f.nmx.reward_rate().unwrap();
        assert!(rate > 0);
        assert!(rate < initial);
    }

    #[test]
    fn test_direct_bonus_limited_to_bonus_emission() {
        let mut f = Fixture::new();
        let owner = f.owner;
        let router = Address::from_label("router");
        f.transfer(&owner, MintPool::Primary, router).unwrap();

        let mut ctx = Context::new(100, &mut f.ledger, &mut f.events);
        let stranger = f.nmx.request_direct_bonus(Address::from_label("x"), 1, &mut ctx).unwrap();
        assert_eq!(stranger, 0);

        let available = f.nmx.schedule().make_progress(&f.nmx.schedule().initial_state(0), 100, MintPool::Bonus).unwrap().0;
        let paid = f.nmx.request_direct_bonus(router, Amount::MAX, &mut ctx).unwrap();
        assert_eq!(paid, available);
        assert_eq!(f.nmx.bonus_reserve(), 0);
    }

    #[test]
    fn test_replacing_schedule_restarts_cursors() {
        let mut f = Fixture::new();
        let owner = f.owner;
        let router = Address::from_label("router");
        f.transfer(&owner, MintPool::Primary, router).unwrap();
        assert!(f.supply(router, 50) > 0);

        let mut pool_rates = [Fixed64x64::ZERO; POOL_COUNT];
        pool_rates[MintPool::Primary.index()] = Fixed64x64::ONE;
        let item = ScheduleItem {
            repeat_count: 1,
            tick_count: 100,
            reward_rate: Some(7),
            repeat_multiplier: Fixed64x64::ONE,
            pool_rates,
        };

        let mut ctx = Context::new(60, &mut f.ledger, &mut f.events);
        assert_eq!(
            f.nmx.set_schedule_items(&router, vec![item.clone()], &mut ctx),
            Err(NmxError::PermissionDenied)
        );
        f.nmx.set_schedule_items(&owner, vec![item], &mut ctx).unwrap();
        assert_eq!(f.nmx.pool_state(MintPool::Primary).time, 60);
        assert_eq!(f.nmx.pool_state(MintPool::Primary).item_index, 0);

        assert_eq!(f.supply(router, 70), 70);
    }
}

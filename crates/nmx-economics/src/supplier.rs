//! NMX suppliers
//!
//! A staking service pulls its rewards from exactly one supplier: the Nmx token
//! itself, a router in front of it, or a fixed-rate supplier.

use nmx_core::{amount_serde, Address, Amount, Ledger, NmxError, Ownable, Result, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::Context;
use crate::events::Event;
use crate::recoverable::Recoverable;

/// Source of newly available NMX
pub trait NmxSupplier {
    fn supplier_address(&self) -> Address;

    /// Hand `caller` everything owed to it up to `min(max_time, now)`
    fn supply_nmx(&mut self, caller: Address, max_time: Timestamp, ctx: &mut Context<'_>)
        -> Result<Amount>;

    /// Pay up to `amount` of bonus to `caller`; returns what was actually paid
    fn request_direct_bonus(
        &mut self,
        caller: Address,
        amount: Amount,
        ctx: &mut Context<'_>,
    ) -> Result<Amount>;
}

/// Mints a constant amount per tick to whoever pulls, with a capped direct bonus
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedRateSupplier {
    address: Address,
    owner: Ownable,
    nmx: TokenId,
    #[serde(with = "amount_serde")]
    nmx_per_tick: Amount,
    last_time: Timestamp,
    #[serde(with = "amount_serde")]
    max_direct_bonus: Amount,
}

impl FixedRateSupplier {
    pub fn new(
        address: Address,
        owner: Address,
        nmx: TokenId,
        nmx_per_tick: Amount,
        start: Timestamp,
    ) -> Self {
        Self {
            address,
            owner: Ownable::new(owner),
            nmx,
            nmx_per_tick,
            last_time: start,
            max_direct_bonus: 0,
        }
    }

    pub fn nmx_per_tick(&self) -> Amount {
        self.nmx_per_tick
    }

    pub fn max_direct_bonus(&self) -> Amount {
        self.max_direct_bonus
    }

    pub fn owner(&self) -> Address {
        self.owner.owner()
    }

    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<()> {
        self.owner.transfer_ownership(caller, new_owner)
    }

    /// Change the rate; ticks before `now` are settled at the old rate on the next pull
    pub fn set_nmx_per_tick(&mut self, caller: &Address, nmx_per_tick: Amount) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        info!(supplier = %self.address, nmx_per_tick, "rate changed");
        self.nmx_per_tick = nmx_per_tick;
        Ok(())
    }

    pub fn set_max_direct_bonus(&mut self, caller: &Address, max_direct_bonus: Amount) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        self.max_direct_bonus = max_direct_bonus;
        Ok(())
    }
}

impl NmxSupplier for FixedRateSupplier {
    fn supplier_address(&self) -> Address {
        self.address
    }

    fn supply_nmx(
        &mut self,
        caller: Address,
        max_time: Timestamp,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        let time = max_time.min(ctx.now);
        if time <= self.last_time {
            return Ok(0);
        }
        let amount = self
            .nmx_per_tick
            .checked_mul((time - self.last_time) as u128)
            .ok_or(NmxError::ArithmeticOverflow)?;
        self.last_time = time;
        ctx.ledger.mint(self.nmx, caller, amount)?;
        debug!(supplier = %self.address, %caller, amount, "fixed rate supply");
        ctx.emit(Event::NmxSupplied {
            supplier: self.address,
            to: caller,
            amount,
        });
        Ok(amount)
    }

    fn request_direct_bonus(
        &mut self,
        caller: Address,
        amount: Amount,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        let paid = amount.min(self.max_direct_bonus);
        if paid > 0 {
            ctx.ledger.mint(self.nmx, caller, paid)?;
            ctx.emit(Event::DirectBonusPaid {
                supplier: self.address,
                to: caller,
                amount: paid,
            });
        }
        Ok(paid)
    }
}

impl Recoverable for FixedRateSupplier {
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
    use nmx_core::MemoryLedger;

    #[test]
    fn test_supplies_elapsed_ticks_once() {
        let nmx = Address::from_label("nmx");
        let service = Address::from_label("service");
        let mut supplier = FixedRateSupplier::new(Address::from_label("faucet"), service, nmx, 5, 100);
        let mut ledger = MemoryLedger::new();
        let mut events = Vec::new();

        let mut ctx = Context::new(110, &mut ledger, &mut events);
        assert_eq!(supplier.supply_nmx(service, u64::MAX, &mut ctx).unwrap(), 50);
        assert_eq!(supplier.supply_nmx(service, u64::MAX, &mut ctx).unwrap(), 0);

        let mut ctx = Context::new(120, &mut ledger, &mut events);
        assert_eq!(supplier.supply_nmx(service, 115, &mut ctx).unwrap(), 25);
        assert_eq!(ledger.balance_of(nmx, service), 75);
    }

    #[test]
    fn test_direct_bonus_is_capped() {
        let nmx = Address::from_label("nmx");
        let owner = Address::from_label("owner");
        let service = Address::from_label("service");
        let mut supplier = FixedRateSupplier::new(Address::from_label("faucet"), owner, nmx, 5, 0);
        supplier.set_max_direct_bonus(&owner, 30).unwrap();
        let mut ledger = MemoryLedger::new();
        let mut events = Vec::new();
        let mut ctx = Context::new(0, &mut ledger, &mut events);

        assert_eq!(supplier.request_direct_bonus(service, 20, &mut ctx).unwrap(), 20);
        assert_eq!(supplier.request_direct_bonus(service, 50, &mut ctx).unwrap(), 30);
        assert_eq!(ledger.balance_of(nmx, service), 50);
    }
}

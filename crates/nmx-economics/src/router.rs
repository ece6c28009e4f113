//! # Staking Router
//!
//! Owns the primary pool of the Nmx token and fans its emission out to staking
//! services by fixed-point share. Each pull distributes everything the upstream
//! supplier has released since the last pull and hands the caller its own pending part.

use indexmap::IndexMap;
use nmx_core::{Address, Amount, Fixed64x64, Ledger, NmxError, Ownable, Result, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::context::Context;
use crate::events::Event;
use crate::recoverable::Recoverable;
use crate::supplier::NmxSupplier;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingRouter {
    address: Address,
    owner: Ownable,
    nmx: TokenId,
    /// Address of the supplier this router pulls from
    upstream: Address,
    shares: IndexMap<Address, Fixed64x64>,
    pending_supplies: BTreeMap<Address, Amount>,
}

impl StakingRouter {
    pub fn new(address: Address, owner: Address, nmx: TokenId, upstream: Address) -> Self {
        Self {
            address,
            owner: Ownable::new(owner),
            nmx,
            upstream,
            shares: IndexMap::new(),
            pending_supplies: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner.owner()
    }

    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<()> {
        self.owner.transfer_ownership(caller, new_owner)
    }

    pub fn upstream(&self) -> Address {
        self.upstream
    }

    /// Share of `service`, zero when it is not in the table
    pub fn share(&self, service: &Address) -> Fixed64x64 {
        self.shares.get(service).copied().unwrap_or(Fixed64x64::ZERO)
    }

    pub fn shares(&self) -> impl Iterator<Item = (&Address, &Fixed64x64)> {
        self.shares.iter()
    }

    pub fn pending_supply(&self, service: &Address) -> Amount {
        self.pending_supplies.get(service).copied().unwrap_or(0)
    }

    pub fn total_pending(&self) -> Amount {
        self.pending_supplies.values().fold(0, |acc, v| acc.saturating_add(*v))
    }

    /// Replace the whole share table. Pending supplies are left as they are.
    pub fn change_staking_service_shares(
        &mut self,
        caller: &Address,
        services: &[Address],
        shares: &[Fixed64x64],
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        self.owner.ensure_owner(caller)?;
        if services.len() != shares.len() {
            return Err(NmxError::SharesLengthMismatch);
        }

        let mut table = IndexMap::with_capacity(services.len());
        let mut total = Fixed64x64::ZERO;
        for (service, share) in services.iter().zip(shares) {
            if *share <= Fixed64x64::ZERO {
                return Err(NmxError::ShareNotPositive);
            }
            if *share > Fixed64x64::ONE {
                return Err(NmxError::ShareTooLarge);
            }
            total = total.checked_add(*share)?;
            if table.insert(*service, *share).is_some() {
                return Err(NmxError::InvalidArgument);
            }
        }
        if total > Fixed64x64::ONE {
            return Err(NmxError::SharesTotalTooLarge);
        }

        info!(router = %self.address, services = table.len(), %total, "staking service shares changed");
        self.shares = table;
        ctx.emit(Event::StakingServiceSharesChanged {
            router: self.address,
            services: services.to_vec(),
            shares: shares.to_vec(),
        });
        Ok(())
    }

    /// Pull from `upstream`, credit every service its share, then pay `caller` its pending part
    pub fn supply_nmx_from(
        &mut self,
        upstream: &mut dyn NmxSupplier,
        caller: Address,
        max_time: Timestamp,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        let supplied = upstream.supply_nmx(self.address, max_time.min(ctx.now), ctx)?;
        if supplied > 0 {
            for (service, share) in &self.shares {
                let part = share.mulu(supplied)?;
                let pending = self.pending_supplies.entry(*service).or_insert(0);
                *pending = pending.checked_add(part).ok_or(NmxError::ArithmeticOverflow)?;
            }
        }

        let amount = self.pending_supplies.remove(&caller).unwrap_or(0);
        if amount > 0 {
            ctx.ledger.transfer(self.nmx, self.address, caller, amount)?;
        }
        debug!(router = %self.address, supplied, %caller, amount, "routed supply");
        ctx.emit(Event::NmxSupplied {
            supplier: self.address,
            to: caller,
            amount,
        });
        Ok(amount)
    }

    /// Forward a direct bonus request from a routed service to the upstream
    pub fn request_direct_bonus_from(
        &mut self,
        upstream: &mut dyn NmxSupplier,
        caller: Address,
        amount: Amount,
        ctx: &mut Context<'_>,
    ) -> Result<Amount> {
        if !self.shares.contains_key(&caller) {
            return Ok(0);
        }
        let paid = upstream.request_direct_bonus(self.address, amount, ctx)?;
        if paid > 0 {
            ctx.ledger.transfer(self.nmx, self.address, caller, paid)?;
        }
        Ok(paid)
    }
}

/// A router bound to its upstream for the duration of one call
pub struct RoutedSupplier<'a> {
    pub router: &'a mut StakingRouter,
    pub upstream: &'a mut dyn NmxSupplier,
}

impl NmxSupplier for RoutedSupplier<'_> {
    fn supplier_address(&self) -> Address {
        self.router.address
    }

    fn supply_nmx(&mut self, caller: Address, max_time: Timestamp, ctx: &mut Context<'_>) -> Result<Amount> {
        self.router.supply_nmx_from(&mut *self.upstream, caller, max_time, ctx)
    }

    fn request_direct_bonus(&mut self, caller: Address, amount: Amount, ctx: &mut Context<'_>) -> Result<Amount> {
        self.router
            .request_direct_bonus_from(&mut *self.upstream, caller, amount, ctx)
    }
}

impl Recoverable for StakingRouter {
    fn contract_address(&self) -> Address {
        self.address
    }

    fn contract_owner(&self) -> Address {
        self.owner.owner()
    }

    fn recoverable_amount(&self, token: TokenId, ledger: &dyn Ledger) -> Result<Amount> {
        let balance = ledger.balance_of(token, self.address);
        if token != self.nmx {
            return Ok(balance);
        }
        Ok(balance.saturating_sub(self.total_pending()))
    }
}

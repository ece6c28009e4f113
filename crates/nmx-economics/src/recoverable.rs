//! Owner escape hatch for tokens sent to a contract by mistake

use nmx_core::{Address, Amount, Ledger, NmxError, Result, TokenId};
use tracing::info;

use crate::context::Context;
use crate::events::Event;

/// A contract whose surplus balances can be withdrawn by its owner
pub trait Recoverable {
    fn contract_address(&self) -> Address;

    fn contract_owner(&self) -> Address;

    /// Balance of `token` not owed to anyone
    fn recoverable_amount(&self, token: TokenId, ledger: &dyn Ledger) -> Result<Amount>;

    fn recover_funds(
        &self,
        caller: &Address,
        token: TokenId,
        to: Address,
        amount: Amount,
        ctx: &mut Context<'_>,
    ) -> Result<()> {
        if *caller != self.contract_owner() {
            return Err(NmxError::PermissionDenied);
        }
        if amount > self.recoverable_amount(token, &*ctx.ledger)? {
            return Err(NmxError::RecoverableAmountNotEnough);
        }
        let contract = self.contract_address();
        ctx.ledger.transfer(token, contract, to, amount)?;
        info!(%contract, %token, %to, amount, "funds recovered");
        ctx.emit(Event::FundsRecovered {
            contract,
            token,
            to,
            amount,
        });
        Ok(())
    }
}

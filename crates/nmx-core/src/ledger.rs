//! Fungible value ledger
//!
//! The engine moves value only through [`Ledger`]. `MemoryLedger` is the in-process
//! implementation used for simulation and replay; it holds any number of tokens,
//! including the native asset.

use crate::authorization::{Domain, Nonces, SignatureVerifier, SignedAuthorization, TypedData};
use crate::error::{NmxError, Result};
use crate::types::{Address, Amount, ChainId, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Balance store with allowance-based pulls
pub trait Ledger {
    fn balance_of(&self, token: TokenId, holder: Address) -> Amount;

    fn total_supply(&self, token: TokenId) -> Amount;

    fn allowance(&self, token: TokenId, owner: Address, spender: Address) -> Amount;

    fn approve(&mut self, token: TokenId, owner: Address, spender: Address, amount: Amount)
        -> Result<()>;

    fn transfer(&mut self, token: TokenId, from: Address, to: Address, amount: Amount)
        -> Result<()>;

    /// Move `amount` from `from` to `to` on behalf of `spender`, consuming allowance
    fn transfer_from(
        &mut self,
        token: TokenId,
        spender: Address,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<()>;

    fn mint(&mut self, token: TokenId, to: Address, amount: Amount) -> Result<()>;

    /// Approve via an owner's signature over the Permit schema
    #[allow(clippy::too_many_arguments)]
    fn permit(
        &mut self,
        verifier: &dyn SignatureVerifier,
        chain_id: ChainId,
        token: TokenId,
        owner: Address,
        spender: Address,
        value: Amount,
        deadline: Timestamp,
        authorization: &SignedAuthorization,
        now: Timestamp,
    ) -> Result<()>;
}

/// Per-token books
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBook {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: Amount,
    pub balances: BTreeMap<Address, Amount>,
    pub allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
    pub nonces: Nonces,
}

impl TokenBook {
    fn balance(&self, holder: &Address) -> Amount {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|by_spender| by_spender.get(spender))
            .copied()
            .unwrap_or(0)
    }

    fn debit(&mut self, holder: Address, amount: Amount) -> Result<()> {
        let available = self.balance(&holder);
        if available < amount {
            return Err(NmxError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        self.balances.insert(holder, available - amount);
        Ok(())
    }

    fn credit(&mut self, holder: Address, amount: Amount) -> Result<()> {
        let balance = self
            .balance(&holder)
            .checked_add(amount)
            .ok_or(NmxError::ArithmeticOverflow)?;
        self.balances.insert(holder, balance);
        Ok(())
    }
}

/// In-memory multi-token ledger
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLedger {
    tokens: BTreeMap<TokenId, TokenBook>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register token metadata. Balances of a re-registered token are kept.
    pub fn register_token(&mut self, token: TokenId, name: &str, symbol: &str, decimals: u8) {
        let book = self.tokens.entry(token).or_default();
        book.name = name.to_string();
        book.symbol = symbol.to_string();
        book.decimals = decimals;
    }

    pub fn token(&self, token: &TokenId) -> Option<&TokenBook> {
        self.tokens.get(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = (&TokenId, &TokenBook)> {
        self.tokens.iter()
    }
}

impl Ledger for MemoryLedger {
    fn balance_of(&self, token: TokenId, holder: Address) -> Amount {
        self.tokens
            .get(&token)
            .map(|book| book.balance(&holder))
            .unwrap_or(0)
    }

    fn total_supply(&self, token: TokenId) -> Amount {
        self.tokens
            .get(&token)
            .map(|book| book.total_supply)
            .unwrap_or(0)
    }

    fn allowance(&self, token: TokenId, owner: Address, spender: Address) -> Amount {
        self.tokens
            .get(&token)
            .map(|book| book.allowance(&owner, &spender))
            .unwrap_or(0)
    }

    fn approve(
        &mut self,
        token: TokenId,
        owner: Address,
        spender: Address,
        amount: Amount,
    ) -> Result<()> {
        self.tokens
            .entry(token)
            .or_default()
            .allowances
            .entry(owner)
            .or_default()
            .insert(spender, amount);
        Ok(())
    }

    fn transfer(&mut self, token: TokenId, from: Address, to: Address, amount: Amount) -> Result<()> {
        let book = self.tokens.entry(token).or_default();
        book.debit(from, amount)?;
        book.credit(to, amount)?;
        debug!(%token, %from, %to, amount, "transfer");
        Ok(())
    }

    fn transfer_from(
        &mut self,
        token: TokenId,
        spender: Address,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<()> {
        let book = self.tokens.entry(token).or_default();
        let available = book.allowance(&from, &spender);
        if available < amount {
            return Err(NmxError::InsufficientAllowance {
                available,
                requested: amount,
            });
        }
        book.debit(from, amount)?;
        book.credit(to, amount)?;
        if available != Amount::MAX {
            book.allowances
                .entry(from)
                .or_default()
                .insert(spender, available - amount);
        }
        debug!(%token, %spender, %from, %to, amount, "transfer_from");
        Ok(())
    }

    fn mint(&mut self, token: TokenId, to: Address, amount: Amount) -> Result<()> {
        let book = self.tokens.entry(token).or_default();
        book.total_supply = book
            .total_supply
            .checked_add(amount)
            .ok_or(NmxError::ArithmeticOverflow)?;
        book.credit(to, amount)?;
        debug!(%token, %to, amount, "mint");
        Ok(())
    }

    fn permit(
        &mut self,
        verifier: &dyn SignatureVerifier,
        chain_id: ChainId,
        token: TokenId,
        owner: Address,
        spender: Address,
        value: Amount,
        deadline: Timestamp,
        authorization: &SignedAuthorization,
        now: Timestamp,
    ) -> Result<()> {
        let book = self.tokens.entry(token).or_default();
        let domain = Domain::new(book.name.clone(), chain_id, token);
        let data = TypedData::Permit {
            owner,
            spender,
            value,
            nonce: book.nonces.current(&owner),
            deadline,
        };
        book.nonces
            .verify_and_use(verifier, &domain, &data, authorization, now)?;
        book.allowances.entry(owner).or_default().insert(spender, value);
        debug!(%token, %owner, %spender, value, "permit");
        Ok(())
    }
}

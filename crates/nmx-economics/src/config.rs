//! Deployment configuration
//!
//! A `ProtocolConfig` describes one full deployment: the Nmx token and its schedule,
//! pool owners, routers, fixed-rate suppliers, staking services and the initial
//! ledger. Amounts are written as strings (`"10e18"`), fractions as decimal strings
//! (`"0.994"`). Addresses accept `0x` hex, `signer:<label>` or a plain label.
//!
//! ```toml
//! chain_id = 1
//! owner = "owner"
//!
//! [nmx]
//! address = "nmx"
//! output_rate = "1"
//!
//! [pool_owners]
//! primary = "router"
//!
//! [[routers]]
//! address = "router"
//! upstream = "nmx"
//! shares = [{ service = "lp-staking", share = "1" }]
//!
//! [[services]]
//! address = "lp-staking"
//! staking_token = "lp"
//! supplier = "router"
//! ```

use nmx_core::{amount_serde, Address, Amount, ChainId, Fixed64x64, NmxError, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bonus::BonusConfig;
use crate::schedule::{MintPool, ScheduleItem};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Protocol(#[from] NmxError),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Complete deployment configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: ChainId,

    /// Distribution start and initial protocol time
    #[serde(default)]
    pub start_time: Timestamp,

    /// Default owner of every contract
    #[serde(default = "default_owner")]
    pub owner: Address,

    #[serde(default)]
    pub nmx: NmxConfig,

    #[serde(default)]
    pub pool_owners: PoolOwnersConfig,

    #[serde(default)]
    pub routers: Vec<RouterConfig>,

    #[serde(default)]
    pub fixed_suppliers: Vec<FixedSupplierConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Tokens other than NMX
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,

    #[serde(default)]
    pub balances: Vec<BalanceConfig>,

    #[serde(default)]
    pub allowances: Vec<AllowanceConfig>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            start_time: 0,
            owner: default_owner(),
            nmx: NmxConfig::default(),
            pool_owners: PoolOwnersConfig::default(),
            routers: Vec::new(),
            fixed_suppliers: Vec::new(),
            services: Vec::new(),
            tokens: Vec::new(),
            balances: Vec::new(),
            allowances: Vec::new(),
        }
    }
}

fn default_chain_id() -> ChainId {
    1
}

fn default_owner() -> Address {
    Address::from_label("owner")
}

fn default_nmx_address() -> TokenId {
    Address::from_label("nmx")
}

fn default_output_rate() -> Fixed64x64 {
    Fixed64x64::ONE
}

fn default_decimals() -> u8 {
    18
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NmxConfig {
    #[serde(default = "default_nmx_address")]
    pub address: TokenId,

    #[serde(default = "default_output_rate")]
    pub output_rate: Fixed64x64,

    /// Custom schedule; the Nominex weekly schedule when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ScheduleItem>>,
}

impl Default for NmxConfig {
    fn default() -> Self {
        Self {
            address: default_nmx_address(),
            output_rate: default_output_rate(),
            items: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOwnersConfig {
    #[serde(default)]
    pub primary: Option<Address>,
    #[serde(default)]
    pub bonus: Option<Address>,
    #[serde(default)]
    pub team: Option<Address>,
    #[serde(default)]
    pub nominex: Option<Address>,
}

impl PoolOwnersConfig {
    /// Configured `(pool, owner)` pairs in pool order
    pub fn assignments(&self) -> Vec<(MintPool, Address)> {
        [
            (MintPool::Primary, self.primary),
            (MintPool::Bonus, self.bonus),
            (MintPool::Team, self.team),
            (MintPool::Nominex, self.nominex),
        ]
        .into_iter()
        .filter_map(|(pool, owner)| owner.map(|owner| (pool, owner)))
        .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareConfig {
    pub service: Address,
    pub share: Fixed64x64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub address: Address,

    /// Supplier the router pulls from, usually the Nmx token
    pub upstream: Address,

    #[serde(default)]
    pub owner: Option<Address>,

    #[serde(default)]
    pub shares: Vec<ShareConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedSupplierConfig {
    pub address: Address,

    #[serde(with = "amount_serde")]
    pub nmx_per_tick: Amount,

    #[serde(default, with = "amount_serde")]
    pub max_direct_bonus: Amount,

    #[serde(default)]
    pub owner: Option<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub address: Address,

    pub staking_token: TokenId,

    /// Nmx token, router or fixed-rate supplier feeding the service
    pub supplier: Address,

    #[serde(default)]
    pub owner: Option<Address>,

    #[serde(default)]
    pub bonus: BonusConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub address: TokenId,

    pub name: String,

    pub symbol: String,

    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceConfig {
    pub token: TokenId,
    pub holder: Address,
    #[serde(with = "amount_serde")]
    pub amount: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceConfig {
    pub token: TokenId,
    pub owner: Address,
    pub spender: Address,
    #[serde(with = "amount_serde")]
    pub amount: Amount,
}

impl ProtocolConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need a built protocol
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = vec![self.nmx.address];
        let contracts = self
            .routers
            .iter()
            .map(|r| r.address)
            .chain(self.fixed_suppliers.iter().map(|s| s.address))
            .chain(self.services.iter().map(|s| s.address));
        for address in contracts {
            if seen.contains(&address) {
                return Err(ConfigError::Invalid(format!(
                    "contract address {address} is used twice"
                )));
            }
            seen.push(address);
        }

        for router in &self.routers {
            if router.upstream != self.nmx.address
                && !self.fixed_suppliers.iter().any(|s| s.address == router.upstream)
            {
                return Err(ConfigError::Invalid(format!(
                    "router {} has unknown upstream {}",
                    router.address, router.upstream
                )));
            }
        }
        for service in &self.services {
            if !seen.contains(&service.supplier) {
                return Err(ConfigError::Invalid(format!(
                    "service {} has unknown supplier {}",
                    service.address, service.supplier
                )));
            }
            service.bonus.validate()?;
        }
        if let Some(items) = &self.nmx.items {
            for item in items {
                item.validate()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ONE_NMX;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ProtocolConfig::from_toml_str("").unwrap();
        assert_eq!(config.chain_id, 1);
        assert_eq!(config.owner, Address::from_label("owner"));
        assert_eq!(config.nmx.output_rate, Fixed64x64::ONE);
        assert!(config.nmx.items.is_none());
        assert!(config.pool_owners.assignments().is_empty());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            chain_id = 56
            start_time = 1000
            owner = "signer:deployer"

            [nmx]
            output_rate = "0.5"

            [pool_owners]
            primary = "router"
            team = "team"

            [[routers]]
            address = "router"
            upstream = "nmx"
            shares = [
                { service = "a", share = "0.25" },
                { service = "b", share = "0.75" },
            ]

            [[services]]
            address = "a"
            staking_token = "lp"
            supplier = "router"

            [services.bonus]
            referral_multiplier = 300
            referrer_multipliers = [{ staked_amount_in_usdt = 100, multiplier = 500 }]

            [[services]]
            address = "b"
            staking_token = "lp"
            supplier = "router"

            [[tokens]]
            address = "lp"
            name = "Nominex LP"
            symbol = "NMXLP"

            [[balances]]
            token = "lp"
            holder = "alice"
            amount = "10e18"
        "#;
        let config = ProtocolConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.chain_id, 56);
        assert_eq!(config.nmx.output_rate, Fixed64x64::from_ratio(1, 2).unwrap());
        assert_eq!(
            config.pool_owners.assignments(),
            vec![
                (MintPool::Primary, Address::from_label("router")),
                (MintPool::Team, Address::from_label("team")),
            ]
        );
        assert_eq!(config.routers[0].shares.len(), 2);
        assert_eq!(config.services[0].bonus.referral_multiplier, 300);
        assert_eq!(config.services[1].bonus, BonusConfig::default());
        assert_eq!(config.tokens[0].decimals, 18);
        assert_eq!(config.balances[0].amount, 10 * ONE_NMX);
    }

    #[test]
    fn test_unknown_supplier_rejected() {
        let toml = r#"
            [[services]]
            address = "a"
            staking_token = "lp"
            supplier = "nowhere"
        "#;
        assert!(matches!(
            ProtocolConfig::from_toml_str(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unordered_bonus_table_rejected() {
        let toml = r#"
            [[services]]
            address = "a"
            staking_token = "lp"
            supplier = "nmx"

            [services.bonus]
            referrer_multipliers = [
                { staked_amount_in_usdt = 300, multiplier = 500 },
                { staked_amount_in_usdt = 100, multiplier = 1000 },
            ]
        "#;
        assert!(matches!(
            ProtocolConfig::from_toml_str(toml),
            Err(ConfigError::Protocol(NmxError::InvalidOrder))
        ));
    }

    #[test]
    fn test_duplicate_contract_rejected() {
        let toml = r#"
            [[fixed_suppliers]]
            address = "nmx"
            nmx_per_tick = "1e18"
        "#;
        assert!(ProtocolConfig::from_toml_str(toml).is_err());
    }
}

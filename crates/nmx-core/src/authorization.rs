//! # Typed-Data Authorization
//!
//! Signatures let a relayer act for an owner. The signed payload follows the EIP-712
//! layout with BLAKE3 as the hash:
//!
//! ```text
//! digest      = H(0x19 0x01 || domainSeparator || structHash)
//! domainSep   = H(H(domainType) || H(name) || H(version) || chainId || verifyingContract)
//! structHash  = H(H(structType) || field words...)
//! ```
//!
//! Signatures are ed25519. The recovered identity is the address derived from the
//! public key carried next to the signature.

use crate::error::{NmxError, Result};
use crate::types::{u128_word, Address, Amount, ChainId, Nonce, Timestamp};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Domain descriptor separating signatures across contracts and networks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub version: String,
    pub chain_id: ChainId,
    pub verifying_contract: Address,
}

impl Domain {
    pub fn new(name: impl Into<String>, chain_id: ChainId, verifying_contract: Address) -> Self {
        Self {
            name: name.into(),
            version: "1".to_string(),
            chain_id,
            verifying_contract,
        }
    }

    pub fn separator(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(5 * 32);
        buf.extend_from_slice(&hash(DOMAIN_TYPE.as_bytes()));
        buf.extend_from_slice(&hash(self.name.as_bytes()));
        buf.extend_from_slice(&hash(self.version.as_bytes()));
        buf.extend_from_slice(&u128_word(self.chain_id as u128));
        buf.extend_from_slice(&self.verifying_contract.to_word());
        hash(&buf)
    }
}

/// Named schemas, one per authorizable operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypedData {
    Permit {
        owner: Address,
        spender: Address,
        value: Amount,
        nonce: Nonce,
        deadline: Timestamp,
    },
    Claim {
        owner: Address,
        spender: Address,
        value: Amount,
        nonce: Nonce,
        deadline: Timestamp,
    },
    Unstake {
        owner: Address,
        spender: Address,
        value: Amount,
        nonce: Nonce,
        deadline: Timestamp,
    },
    SetReferrer {
        owner: Address,
        referrer: Address,
        nonce: Nonce,
        deadline: Timestamp,
    },
}

impl TypedData {
    pub fn type_string(&self) -> &'static str {
        match self {
            Self::Permit { .. } => {
                "Permit(address owner,address spender,uint256 value,uint256 nonce,uint256 deadline)"
            }
            Self::Claim { .. } => {
                "Claim(address owner,address spender,uint256 value,uint256 nonce,uint256 deadline)"
            }
            Self::Unstake { .. } => {
                "Unstake(address owner,address spender,uint256 value,uint256 nonce,uint256 deadline)"
            }
            Self::SetReferrer { .. } => {
                "SetReferrer(address owner,address referrer,uint256 nonce,uint256 deadline)"
            }
        }
    }

    pub fn owner(&self) -> Address {
        match self {
            Self::Permit { owner, .. }
            | Self::Claim { owner, .. }
            | Self::Unstake { owner, .. }
            | Self::SetReferrer { owner, .. } => *owner,
        }
    }

    pub fn deadline(&self) -> Timestamp {
        match self {
            Self::Permit { deadline, .. }
            | Self::Claim { deadline, .. }
            | Self::Unstake { deadline, .. }
            | Self::SetReferrer { deadline, .. } => *deadline,
        }
    }

    pub fn struct_hash(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(6 * 32);
        buf.extend_from_slice(&hash(self.type_string().as_bytes()));
        match self {
            Self::Permit {
                owner,
                spender,
                value,
                nonce,
                deadline,
            }
            | Self::Claim {
                owner,
                spender,
                value,
                nonce,
                deadline,
            }
            | Self::Unstake {
                owner,
                spender,
                value,
                nonce,
                deadline,
            } => {
                buf.extend_from_slice(&owner.to_word());
                buf.extend_from_slice(&spender.to_word());
                buf.extend_from_slice(&u128_word(*value));
                buf.extend_from_slice(&u128_word(*nonce as u128));
                buf.extend_from_slice(&u128_word(*deadline as u128));
            }
            Self::SetReferrer {
                owner,
                referrer,
                nonce,
                deadline,
            } => {
                buf.extend_from_slice(&owner.to_word());
                buf.extend_from_slice(&referrer.to_word());
                buf.extend_from_slice(&u128_word(*nonce as u128));
                buf.extend_from_slice(&u128_word(*deadline as u128));
            }
        }
        hash(&buf)
    }

    pub fn digest(&self, domain: &Domain) -> [u8; 32] {
        let mut buf = Vec::with_capacity(2 + 64);
        buf.extend_from_slice(&[0x19, 0x01]);
        buf.extend_from_slice(&domain.separator());
        buf.extend_from_slice(&self.struct_hash());
        hash(&buf)
    }
}

/// Signature plus the public key it claims to come from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAuthorization {
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

/// Capability that turns a digest and a signature into the signer's identity
pub trait SignatureVerifier: Send + Sync {
    fn recover(&self, digest: &[u8; 32], authorization: &SignedAuthorization) -> Result<Address>;
}

/// ed25519 verifier
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn recover(&self, digest: &[u8; 32], authorization: &SignedAuthorization) -> Result<Address> {
        let public_key: [u8; 32] = authorization
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| NmxError::InvalidSignature)?;
        let key = VerifyingKey::from_bytes(&public_key).map_err(|_| NmxError::InvalidSignature)?;
        let signature = Signature::from_slice(&authorization.signature)
            .map_err(|_| NmxError::InvalidSignature)?;
        key.verify(digest, &signature)
            .map_err(|_| NmxError::InvalidSignature)?;
        Ok(Address::from_public_key(&public_key))
    }
}

/// Key holder producing authorizations (wallet side, used by simulations and tests)
#[derive(Clone)]
pub struct SigningAccount {
    key: SigningKey,
}

impl SigningAccount {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Deterministic key for a human-readable label
    pub fn from_label(label: &str) -> Self {
        Self::from_seed(hash(label.as_bytes()))
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self.key.verifying_key().as_bytes())
    }

    pub fn sign(&self, data: &TypedData, domain: &Domain) -> SignedAuthorization {
        let digest = data.digest(domain);
        SignedAuthorization {
            public_key: self.key.verifying_key().as_bytes().to_vec(),
            signature: self.key.sign(&digest).to_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for SigningAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningAccount({})", self.address())
    }
}

/// Strictly incrementing per-owner nonces
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonces(BTreeMap<Address, Nonce>);

impl Nonces {
    pub fn current(&self, owner: &Address) -> Nonce {
        self.0.get(owner).copied().unwrap_or(0)
    }

    /// Check deadline and signer, then consume the owner's nonce.
    ///
    /// `data` must carry `self.current(owner)` as its nonce; an authorization signed
    /// over any other nonce produces a different digest and fails as a bad signature.
    pub fn verify_and_use(
        &mut self,
        verifier: &dyn SignatureVerifier,
        domain: &Domain,
        data: &TypedData,
        authorization: &SignedAuthorization,
        now: Timestamp,
    ) -> Result<()> {
        if now > data.deadline() {
            return Err(NmxError::Expired);
        }
        let signer = verifier.recover(&data.digest(domain), authorization)?;
        if signer != data.owner() {
            return Err(NmxError::InvalidSignature);
        }
        let nonce = self.0.entry(data.owner()).or_insert(0);
        *nonce = nonce.checked_add(1).ok_or(NmxError::ArithmeticOverflow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(owner: Address, nonce: Nonce, value: Amount) -> TypedData {
        TypedData::Claim {
            owner,
            spender: Address::from_label("relayer"),
            value,
            nonce,
            deadline: 100,
        }
    }

    #[test]
    fn test_signature_recovers_signer() {
        let alice = SigningAccount::from_label("alice");
        let domain = Domain::new("StakingService", 1, Address::from_label("service"));
        let data = claim(alice.address(), 0, 5);
        let auth = alice.sign(&data, &domain);

        let recovered = Ed25519Verifier.recover(&data.digest(&domain), &auth).unwrap();
        assert_eq!(recovered, alice.address());
    }

    #[test]
    fn test_domain_separates_signatures() {
        let alice = SigningAccount::from_label("alice");
        let domain = Domain::new("StakingService", 1, Address::from_label("service"));
        let other_chain = Domain::new("StakingService", 2, Address::from_label("service"));
        let other_contract = Domain::new("StakingService", 1, Address::from_label("other"));
        let data = claim(alice.address(), 0, 5);
        let auth = alice.sign(&data, &domain);

        let mut nonces = Nonces::default();
        assert_eq!(
            nonces.verify_and_use(&Ed25519Verifier, &other_chain, &data, &auth, 10),
            Err(NmxError::InvalidSignature)
        );
        assert_eq!(
            nonces.verify_and_use(&Ed25519Verifier, &other_contract, &data, &auth, 10),
            Err(NmxError::InvalidSignature)
        );
        assert_eq!(nonces.current(&alice.address()), 0);
    }

    #[test]
    fn test_nonce_is_consumed_once() {
        let alice = SigningAccount::from_label("alice");
        let domain = Domain::new("StakingService", 1, Address::from_label("service"));
        let data = claim(alice.address(), 0, 5);
        let auth = alice.sign(&data, &domain);

        let mut nonces = Nonces::default();
        nonces
            .verify_and_use(&Ed25519Verifier, &domain, &data, &auth, 10)
            .unwrap();
        assert_eq!(nonces.current(&alice.address()), 1);

        // replay: the contract now expects nonce 1
        let replay = claim(alice.address(), nonces.current(&alice.address()), 5);
        assert_eq!(
            nonces.verify_and_use(&Ed25519Verifier, &domain, &replay, &auth, 10),
            Err(NmxError::InvalidSignature)
        );
    }

    #[test]
    fn test_expired_before_signature_check() {
        let alice = SigningAccount::from_label("alice");
        let domain = Domain::new("StakingService", 1, Address::from_label("service"));
        let data = claim(alice.address(), 0, 5);
        let garbage = SignedAuthorization {
            public_key: vec![0; 32],
            signature: vec![0; 64],
        };

        let mut nonces = Nonces::default();
        assert_eq!(
            nonces.verify_and_use(&Ed25519Verifier, &domain, &data, &garbage, 101),
            Err(NmxError::Expired)
        );
        assert_eq!(
            nonces.verify_and_use(&Ed25519Verifier, &domain, &data, &garbage, 100),
            Err(NmxError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let alice = SigningAccount::from_label("alice");
        let mallory = SigningAccount::from_label("mallory");
        let domain = Domain::new("StakingService", 1, Address::from_label("service"));
        let data = claim(alice.address(), 0, 5);
        let auth = mallory.sign(&data, &domain);

        let mut nonces = Nonces::default();
        assert_eq!(
            nonces.verify_and_use(&Ed25519Verifier, &domain, &data, &auth, 10),
            Err(NmxError::InvalidSignature)
        );
    }

    #[test]
    fn test_struct_hash_depends_on_schema() {
        let owner = Address::from_label("alice");
        let spender = Address::from_label("relayer");
        let claim = TypedData::Claim {
            owner,
            spender,
            value: 1,
            nonce: 0,
            deadline: 1,
        };
        let unstake = TypedData::Unstake {
            owner,
            spender,
            value: 1,
            nonce: 0,
            deadline: 1,
        };
        assert_ne!(claim.struct_hash(), unstake.struct_hash());
    }
}

//! Compiled transaction match rules. Configuration lists
//! `(contract_address, func_sig)` pairs with collection flags; at startup
//! they are folded into a two-level lookup so the per-transaction check in
//! the filter stage is two hash probes per wildcard combination.

use std::collections::HashMap;

use ethers::types::H160;

use crate::config::TransactionInfo;
use crate::error::IndexerError;

/// The sentinel that makes either side of a rule match anything.
pub const WILDCARD: &str = "undefined";

pub type Selector = [u8; 4];

/// What to collect for a matched transaction. Multiple hits on the same
/// transaction OR together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxPolicy {
    pub status: bool,
    pub collect_events: bool,
    pub collect_signature: bool,
}

impl TxPolicy {
    pub fn needs_receipt(&self) -> bool {
        self.status || self.collect_events
    }

    fn merge(&mut self, other: &TxPolicy) {
        self.status |= other.status;
        self.collect_events |= other.collect_events;
        self.collect_signature |= other.collect_signature;
    }
}

/// `address -> selector -> policy`, with `None` as the wildcard bucket on
/// both levels.
#[derive(Debug, Default)]
pub struct TxMatcher {
    rules: HashMap<Option<H160>, HashMap<Option<Selector>, TxPolicy>>,
}

impl TxMatcher {
    pub fn compile(items: &[TransactionInfo]) -> Result<Self, IndexerError> {
        let mut rules: HashMap<Option<H160>, HashMap<Option<Selector>, TxPolicy>> = HashMap::new();

        for item in items {
            let address = parse_address(&item.contract_address)?;
            let selector = parse_selector(&item.func_sig)?;

            let policy = TxPolicy {
                status: item.status,
                collect_events: item.collect_events,
                collect_signature: item.signature,
            };

            rules
                .entry(address)
                .or_default()
                .entry(selector)
                .or_default()
                .merge(&policy);
        }

        Ok(Self { rules })
    }

    /// Scans `{to, wildcard} x {selector, wildcard}`; any hit contributes
    /// to the returned policy. `None` means the transaction is not
    /// interesting.
    pub fn match_tx(&self, to: H160, selector: Selector) -> Option<TxPolicy> {
        let mut matched = false;
        let mut policy = TxPolicy::default();

        for address_key in [Some(to), None] {
            let Some(by_selector) = self.rules.get(&address_key) else {
                continue;
            };
            for selector_key in [Some(selector), None] {
                if let Some(hit) = by_selector.get(&selector_key) {
                    matched = true;
                    policy.merge(hit);
                }
            }
        }

        matched.then_some(policy)
    }
}

/// First four bytes of calldata; `None` when the calldata is shorter.
pub fn selector_of(input: &[u8]) -> Option<Selector> {
    let bytes: &[u8; 4] = input.get(..4)?.try_into().ok()?;
    Some(*bytes)
}

pub(crate) fn parse_address(raw: &str) -> Result<Option<H160>, IndexerError> {
    if raw == WILDCARD {
        return Ok(None);
    }

    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped)
        .map_err(|err| IndexerError::Config(format!("invalid contract address {raw}: {err}")))?;

    if bytes.len() != 20 {
        return Err(IndexerError::Config(format!(
            "invalid contract address length: {raw}"
        )));
    }

    Ok(Some(H160::from_slice(&bytes)))
}

fn parse_selector(raw: &str) -> Result<Option<Selector>, IndexerError> {
    if raw == WILDCARD {
        return Ok(None);
    }

    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped)
        .map_err(|err| IndexerError::Config(format!("invalid function signature {raw}: {err}")))?;

    let selector: Selector = bytes.try_into().map_err(|_| {
        IndexerError::Config(format!("invalid length function signature: {raw}"))
    })?;

    Ok(Some(selector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(address: &str, func_sig: &str, status: bool, events: bool, sig: bool) -> TransactionInfo {
        TransactionInfo {
            contract_address: address.to_owned(),
            func_sig: func_sig.to_owned(),
            status,
            collect_events: events,
            signature: sig,
        }
    }

    const ADDR: &str = "0x694905ca5f9f6c49f4748e8193b3e8053fa9e7e4";

    fn addr() -> H160 {
        ADDR.parse().unwrap()
    }

    #[test]
    fn exact_rule_matches_only_its_pair() {
        let matcher =
            TxMatcher::compile(&[info(ADDR, "0xf14fcbc8", true, true, false)]).unwrap();

        let policy = matcher.match_tx(addr(), [0xf1, 0x4f, 0xcb, 0xc8]).unwrap();
        assert!(policy.status && policy.collect_events && !policy.collect_signature);

        assert!(matcher.match_tx(addr(), [0, 0, 0, 0]).is_none());
        assert!(matcher
            .match_tx(H160::zero(), [0xf1, 0x4f, 0xcb, 0xc8])
            .is_none());
    }

    #[test]
    fn wildcard_selector_matches_any_calldata() {
        let matcher = TxMatcher::compile(&[info(ADDR, WILDCARD, false, true, false)]).unwrap();

        assert!(matcher.match_tx(addr(), [1, 2, 3, 4]).is_some());
        assert!(matcher.match_tx(H160::zero(), [1, 2, 3, 4]).is_none());
    }

    #[test]
    fn wildcard_address_matches_any_recipient() {
        let matcher =
            TxMatcher::compile(&[info(WILDCARD, "0xe48b3c65", true, false, true)]).unwrap();

        let policy = matcher.match_tx(H160::zero(), [0xe4, 0x8b, 0x3c, 0x65]).unwrap();
        assert!(policy.status && policy.collect_signature);
        assert!(matcher.match_tx(H160::zero(), [0, 0, 0, 0]).is_none());
    }

    #[test]
    fn overlapping_hits_or_their_flags() {
        let matcher = TxMatcher::compile(&[
            info(ADDR, "0xf14fcbc8", true, false, false),
            info(ADDR, WILDCARD, false, true, false),
            info(WILDCARD, WILDCARD, false, false, true),
        ])
        .unwrap();

        let policy = matcher.match_tx(addr(), [0xf1, 0x4f, 0xcb, 0xc8]).unwrap();
        assert!(policy.status && policy.collect_events && policy.collect_signature);

        // A different recipient only sees the global wildcard.
        let policy = matcher.match_tx(H160::zero(), [0xf1, 0x4f, 0xcb, 0xc8]).unwrap();
        assert_eq!(
            policy,
            TxPolicy {
                status: false,
                collect_events: false,
                collect_signature: true
            }
        );
    }

    #[test]
    fn short_calldata_has_no_selector() {
        assert_eq!(selector_of(&[1, 2, 3]), None);
        assert_eq!(selector_of(&[1, 2, 3, 4, 5]), Some([1, 2, 3, 4]));
    }

    #[test]
    fn bad_selector_length_is_a_config_error() {
        let err = TxMatcher::compile(&[info(ADDR, "0xf14fcb", false, false, false)]).unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn address_without_prefix_is_accepted() {
        let parsed = parse_address("694905ca5f9f6c49f4748e8193b3e8053fa9e7e4").unwrap();
        assert_eq!(parsed, Some(addr()));
    }
}

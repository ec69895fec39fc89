//! CAIP identifiers and the rules tying granted namespaces to requested ones.
use std::collections::BTreeSet;

use super::types::{Namespaces, RequiredNamespace, RequiredNamespaces, SessionNamespace};
use crate::ProtocolError;

fn is_namespace_part(s: &str) -> bool {
    (3..=8).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn is_reference_part(s: &str) -> bool {
    (1..=32).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// CAIP-2 `namespace:reference`, e.g. `eip155:1`.
pub fn is_valid_chain_id(chain: &str) -> bool {
    match chain.split_once(':') {
        Some((namespace, reference)) => is_namespace_part(namespace) && is_reference_part(reference),
        None => false,
    }
}

/// CAIP-10 `namespace:reference:address`.
pub fn is_valid_account_id(account: &str) -> bool {
    match account.rsplit_once(':') {
        Some((chain, address)) => {
            is_valid_chain_id(chain)
                && (1..=128).contains(&address.len())
                && address
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"-.%".contains(&b))
        }
        None => false,
    }
}

fn chain_of_account(account: &str) -> Option<&str> {
    account.rsplit_once(':').map(|(chain, _)| chain)
}

/// Chains a proposer asks for under `key`. A key that is itself a chain id
/// stands for that chain.
fn required_chains<'a>(key: &'a str, ns: &'a RequiredNamespace) -> Vec<&'a str> {
    match &ns.chains {
        Some(chains) => chains.iter().map(String::as_str).collect(),
        None if key.contains(':') => vec![key],
        None => Vec::new(),
    }
}

/// Chains granted under `key`: explicit chains plus account prefixes.
pub fn granted_chains<'a>(key: &'a str, ns: &'a SessionNamespace) -> BTreeSet<&'a str> {
    let mut chains: BTreeSet<&str> = ns.accounts.iter().filter_map(|a| chain_of_account(a)).collect();
    if let Some(explicit) = &ns.chains {
        chains.extend(explicit.iter().map(String::as_str));
    }
    if key.contains(':') {
        chains.insert(key);
    }
    chains
}

/// Shape check for namespaces a proposer requests.
pub fn validate_required(required: &RequiredNamespaces, context: &str) -> Result<(), ProtocolError> {
    for (key, ns) in required {
        if key.is_empty() {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "{context} requiredNamespaces, empty key"
            )));
        }
        match &ns.chains {
            Some(chains) => {
                if let Some(bad) = chains.iter().find(|c| !is_valid_chain_id(c)) {
                    return Err(ProtocolError::MissingOrInvalid(format!(
                        "{context} requiredNamespaces, chain {bad} should be a string and conform to \"namespace:chainId\" format"
                    )));
                }
            }
            None if !is_valid_chain_id(key) => {
                return Err(ProtocolError::MissingOrInvalid(format!(
                    "{context} requiredNamespaces, {key} needs chains or a chain id as key"
                )));
            }
            None => {}
        }
    }
    Ok(())
}

/// Shape check for namespaces a responder grants.
pub fn validate_namespaces(namespaces: &Namespaces, context: &str) -> Result<(), ProtocolError> {
    if namespaces.is_empty() {
        return Err(ProtocolError::MissingOrInvalid(format!(
            "{context} namespaces should be an object with data"
        )));
    }
    for (key, ns) in namespaces {
        if let Some(bad) = ns.accounts.iter().find(|a| !is_valid_account_id(a)) {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "{context} namespaces, account {bad} should be a string and conform to \"namespace:chainId:address\" format"
            )));
        }
        if let Some(bad) = ns
            .chains
            .iter()
            .flatten()
            .find(|c| !is_valid_chain_id(c))
        {
            return Err(ProtocolError::MissingOrInvalid(format!(
                "{context} namespaces, {key} chain {bad} is not a chain id"
            )));
        }
    }
    Ok(())
}

/// Granted namespaces must cover every required key, chain, method and event.
pub fn check_conforming(
    required: &RequiredNamespaces,
    namespaces: &Namespaces,
    context: &str,
) -> Result<(), ProtocolError> {
    for (key, want) in required {
        let Some(granted) = namespaces.get(key) else {
            return Err(ProtocolError::NonConformingNamespaces(format!(
                "{context} namespaces keys don't satisfy requiredNamespaces"
            )));
        };
        let chains = granted_chains(key, granted);
        if let Some(missing) = required_chains(key, want).into_iter().find(|c| !chains.contains(c)) {
            return Err(ProtocolError::NonConformingNamespaces(format!(
                "{context} namespaces chains don't satisfy requiredNamespaces chains for {key}: missing {missing}"
            )));
        }
        if let Some(missing) = want.methods.iter().find(|m| !granted.methods.contains(m)) {
            return Err(ProtocolError::NonConformingNamespaces(format!(
                "{context} namespaces methods don't satisfy requiredNamespaces methods for {key}: missing {missing}"
            )));
        }
        if let Some(missing) = want.events.iter().find(|e| !granted.events.contains(e)) {
            return Err(ProtocolError::NonConformingNamespaces(format!(
                "{context} namespaces events don't satisfy requiredNamespaces events for {key}: missing {missing}"
            )));
        }
    }
    Ok(())
}

pub fn is_chain_granted(namespaces: &Namespaces, chain: &str) -> bool {
    namespaces
        .iter()
        .any(|(key, ns)| granted_chains(key, ns).contains(chain))
}

pub fn is_method_granted(namespaces: &Namespaces, chain: &str, method: &str) -> bool {
    namespaces.iter().any(|(key, ns)| {
        granted_chains(key, ns).contains(chain) && ns.methods.iter().any(|m| m == method)
    })
}

pub fn is_event_granted(namespaces: &Namespaces, chain: &str, event: &str) -> bool {
    namespaces.iter().any(|(key, ns)| {
        granted_chains(key, ns).contains(chain) && ns.events.iter().any(|e| e == event)
    })
}

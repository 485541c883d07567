//! Canonical symbol registry shared by every collector and the materializer.
//!
//! Sources may spell a symbol differently (`BTCUSDT`, `btc`, `XBT`). All of
//! them are mapped onto one canonical identifier before anything is written,
//! and a symbol unknown to the registry is rejected rather than guessed.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolRegistry {
    symbols: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
}

impl SymbolRegistry {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            symbols: symbols
                .into_iter()
                .map(|symbol| normalize(symbol.as_ref()))
                .filter(|symbol| !symbol.is_empty())
                .collect(),
            aliases: BTreeMap::new(),
        }
    }

    /// Registers `alias` as another spelling of `canonical`. Returns false if
    /// `canonical` is not tracked.
    pub fn add_alias(&mut self, alias: &str, canonical: &str) -> bool {
        let canonical = normalize(canonical);
        if !self.symbols.contains(&canonical) {
            return false;
        }
        self.aliases.insert(normalize(alias), canonical);
        true
    }

    pub fn canonicalize(&self, raw: &str) -> Option<&str> {
        let key = normalize(raw);
        if let Some(symbol) = self.symbols.get(&key) {
            return Some(symbol.as_str());
        }
        self.aliases.get(&key).map(String::as_str)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.canonicalize(symbol).is_some()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_case_and_aliases() {
        let mut registry = SymbolRegistry::new(["btc", "ETH"]);
        assert!(registry.add_alias("BTCUSDT", "BTC"));
        assert!(registry.add_alias("xbt", "btc"));
        assert!(!registry.add_alias("SOLUSDT", "SOL"));

        assert_eq!(registry.canonicalize(" btc "), Some("BTC"));
        assert_eq!(registry.canonicalize("btcusdt"), Some("BTC"));
        assert_eq!(registry.canonicalize("XBT"), Some("BTC"));
        assert_eq!(registry.canonicalize("SOLUSDT"), None);
        assert_eq!(registry.symbols().collect::<Vec<_>>(), vec!["BTC", "ETH"]);
    }
}

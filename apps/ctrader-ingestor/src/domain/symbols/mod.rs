//! Symbol Directory
//!
//! Resolves caller-facing instrument names to broker-assigned identifiers.
//!
//! # Design
//!
//! - A fixed alias table maps names used by callers onto the names the
//!   broker lists (`WTIUSD` is `XTIUSD` at the broker). Names without an
//!   alias pass through unchanged.
//! - The directory is loaded in full from one symbol-list response and is
//!   read-only afterwards until the next full load replaces it. Entries are
//!   never evicted during a session.
//! - Lookups are case-sensitive, keyed exactly as the broker returned them.

use std::collections::HashMap;

use crate::domain::market_data::{SymbolId, SymbolInfo};

/// Decimal places of the broker's relative price format (1e-5 units).
pub const RELATIVE_PRICE_DIGITS: u32 = 5;

/// Built-in caller -> broker name mapping.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("WTIUSD", "XTIUSD"),
    ("BCOUSD", "XBRUSD"),
    ("NSXUSD", "USTEC"),
    ("SPXUSD", "US500"),
    ("UDXUSD", "USDX"),
    ("JPXJPY", "JP225"),
    ("UKXGBP", "UK100"),
    ("GRXEUR", "DE40"),
    ("ETXEUR", "STOXX50"),
];

// =============================================================================
// Aliases
// =============================================================================

/// Caller-facing to broker-facing instrument name mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolAliases {
    forward: HashMap<String, String>,
}

impl Default for SymbolAliases {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SymbolAliases {
    /// Alias table with no entries; every name passes through.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            forward: HashMap::new(),
        }
    }

    /// The built-in alias table.
    #[must_use]
    pub fn builtin() -> Self {
        Self::empty().with_overrides(
            BUILTIN_ALIASES
                .iter()
                .map(|(caller, broker)| ((*caller).to_string(), (*broker).to_string())),
        )
    }

    /// Add or replace entries.
    #[must_use]
    pub fn with_overrides(mut self, entries: impl IntoIterator<Item = (String, String)>) -> Self {
        self.forward.extend(entries);
        self
    }

    /// Broker-facing name for a caller-facing one.
    #[must_use]
    pub fn to_broker<'a>(&'a self, caller: &'a str) -> &'a str {
        self.forward.get(caller).map_or(caller, String::as_str)
    }

    /// Number of alias entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

// =============================================================================
// Directory
// =============================================================================

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Broker-assigned identifier.
    pub id: SymbolId,
    /// Broker-facing name.
    pub name: String,
    /// Published quote precision, once symbol details were fetched.
    pub digits: Option<u32>,
}

/// Outcome of resolving a caller-facing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The directory has not been loaded yet.
    NotLoaded,
    /// Loaded, and the name is unknown to the broker.
    NotFound,
    /// Resolved to a broker identifier.
    Found(SymbolId),
}

/// Name -> identifier cache, loaded from the broker's symbol list.
#[derive(Debug, Default)]
pub struct SymbolDirectory {
    aliases: SymbolAliases,
    by_name: HashMap<String, SymbolEntry>,
    by_id: HashMap<SymbolId, String>,
    loaded: bool,
}

impl SymbolDirectory {
    /// Create an empty directory using the given alias table.
    #[must_use]
    pub fn new(aliases: SymbolAliases) -> Self {
        Self {
            aliases,
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            loaded: false,
        }
    }

    /// Whether a symbol list has been loaded.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Number of known symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no symbols are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Replace the directory contents with a full symbol list.
    ///
    /// Published precision survives a reload for identifiers that are
    /// still listed.
    pub fn load(&mut self, symbols: impl IntoIterator<Item = SymbolInfo>) {
        let previous_digits: HashMap<SymbolId, u32> = self
            .by_name
            .values()
            .filter_map(|entry| entry.digits.map(|digits| (entry.id, digits)))
            .collect();

        self.by_name.clear();
        self.by_id.clear();

        for info in symbols {
            let entry = SymbolEntry {
                id: info.id,
                digits: previous_digits.get(&info.id).copied(),
                name: info.name.clone(),
            };
            self.by_id.insert(info.id, info.name.clone());
            self.by_name.insert(info.name, entry);
        }

        self.loaded = true;
    }

    /// Resolve a caller-facing name.
    #[must_use]
    pub fn resolve(&self, caller: &str) -> Resolution {
        if !self.loaded {
            return Resolution::NotLoaded;
        }

        self.by_name
            .get(self.aliases.to_broker(caller))
            .map_or(Resolution::NotFound, |entry| Resolution::Found(entry.id))
    }

    /// Broker-facing name for the name a caller used.
    #[must_use]
    pub fn broker_name<'a>(&'a self, caller: &'a str) -> &'a str {
        self.aliases.to_broker(caller)
    }

    /// Broker-facing name for an identifier.
    #[must_use]
    pub fn name_of(&self, id: SymbolId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Entry for an identifier.
    #[must_use]
    pub fn entry(&self, id: SymbolId) -> Option<&SymbolEntry> {
        self.name_of(id).and_then(|name| self.by_name.get(name))
    }

    /// Published precision for an identifier, if fetched.
    #[must_use]
    pub fn digits(&self, id: SymbolId) -> Option<u32> {
        self.entry(id).and_then(|entry| entry.digits)
    }

    /// Record the published precision for an identifier.
    pub fn set_digits(&mut self, id: SymbolId, digits: u32) {
        if let Some(name) = self.by_id.get(&id)
            && let Some(entry) = self.by_name.get_mut(name)
        {
            entry.digits = Some(digits);
        }
    }

    /// All known symbols, sorted by name.
    #[must_use]
    pub fn symbols(&self) -> Vec<SymbolInfo> {
        let mut symbols: Vec<SymbolInfo> = self
            .by_name
            .values()
            .map(|entry| SymbolInfo {
                id: entry.id,
                name: entry.name.clone(),
            })
            .collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        symbols
    }
}

// =============================================================================
// Tests
// =============================================================================

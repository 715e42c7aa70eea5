//! Short alphabetic aliases for tables and acquisition levels.

use std::collections::{HashMap, HashSet};

/// Alias made of the first character of every underscore separated word,
/// upper-cased. `VESSEL_USE_MEASUREMENT` becomes `VUM`.
pub fn base_alias(name: &str) -> String {
    let alias: String = name
        .split(['_', '.', ' '])
        .filter_map(|word| word.chars().next())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if alias.is_empty() {
        "T".to_string()
    } else {
        alias
    }
}

/// Hands out unique aliases, disambiguating collisions with a numeric
/// suffix. The same name always gets the same alias.
#[derive(Debug, Default)]
pub struct AliasGenerator {
    by_name: HashMap<String, String>,
    used: HashSet<String>,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an alias as taken without binding it to a name.
    pub fn reserve(&mut self, alias: &str) {
        self.used.insert(alias.to_ascii_uppercase());
    }

    /// Forget the alias of `name`, making it available again.
    pub fn release(&mut self, name: &str) {
        if let Some(alias) = self.by_name.remove(&name.to_ascii_lowercase()) {
            self.used.remove(&alias);
        }
    }

    pub fn alias_for(&mut self, name: &str) -> String {
        let key = name.to_ascii_lowercase();
        if let Some(alias) = self.by_name.get(&key) {
            return alias.clone();
        }

        let base = base_alias(name);
        let mut alias = base.clone();
        let mut suffix = 1;
        while self.used.contains(&alias) {
            alias = format!("{base}{suffix}");
            suffix += 1;
        }

        self.used.insert(alias.clone());
        self.by_name.insert(key, alias.clone());
        alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_letters() {
        assert_eq!("VUM", base_alias("VESSEL_USE_MEASUREMENT"));
        assert_eq!("T", base_alias("trip"));
        assert_eq!("ET1", base_alias("EXT_TR_1700000000000"));
        assert_eq!("T", base_alias(""));
    }

    #[test]
    fn collisions_get_a_suffix() {
        let mut aliases = AliasGenerator::new();
        assert_eq!("SM", aliases.alias_for("SAMPLE_MEASUREMENT"));
        assert_eq!("SM1", aliases.alias_for("SORTING_MEASUREMENT"));
        assert_eq!("SM2", aliases.alias_for("SURVEY_MEASUREMENT"));
        // Stable per name, case insensitive.
        assert_eq!("SM1", aliases.alias_for("sorting_measurement"));
    }

    #[test]
    fn released_aliases_are_reused() {
        let mut aliases = AliasGenerator::new();
        assert_eq!("EH1", aliases.alias_for("EXT_HH_1"));
        assert_eq!("EH11", aliases.alias_for("EXT_HH_17"));
        aliases.release("ext_hh_1");
        assert_eq!("EH1", aliases.alias_for("EXT_HH_19"));
        // Releasing an unknown name is a no-op.
        aliases.release("EXT_HH_3");
        assert_eq!("EH11", aliases.alias_for("EXT_HH_17"));
    }

    #[test]
    fn reserved_aliases_are_skipped() {
        let mut aliases = AliasGenerator::new();
        aliases.reserve("vum");
        assert_eq!("VUM1", aliases.alias_for("VESSEL_USE_MEASUREMENT"));
    }
}

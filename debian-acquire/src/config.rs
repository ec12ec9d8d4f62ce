// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Method configuration.

The parent process forwards its configuration space to workers as
`601 Configuration` messages holding repeated `Config-Item: key=value`
tags. Keys use the APT `::` separated naming scheme and compare
case-insensitively.
*/

use {crate::protocol::Message, std::collections::HashMap};

/// Flat key-value configuration store populated from `601 Configuration`.
#[derive(Clone, Debug, Default)]
pub struct MethodConfig {
    items: HashMap<String, String>,
}

impl MethodConfig {
    /// Set a single configuration item.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl ToString) {
        self.items
            .insert(key.as_ref().to_ascii_lowercase(), value.to_string());
    }

    /// Fold a `601 Configuration` message into the store.
    ///
    /// Tags that do not have the `key=value` shape are ignored.
    pub fn merge_message(&mut self, message: &Message) {
        for item in message.values("Config-Item") {
            if let Some((key, value)) = item.split_once('=') {
                self.set(key, value);
            }
        }
    }

    /// Look up a string value.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.items
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Look up a boolean value, with APT's spelling conventions.
    pub fn find_bool(&self, key: &str, default: bool) -> bool {
        match self.find(key) {
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("yes") => true,
            Some("1") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            Some(v) if v.eq_ignore_ascii_case("no") => false,
            Some("0") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut config = MethodConfig::default();
        config.set("Acquire::http::Proxy", "http://proxy.example:3128");
        assert_eq!(
            config.find("acquire::HTTP::proxy"),
            Some("http://proxy.example:3128")
        );
        assert_eq!(config.find("Acquire::http::Proxy::other"), None);
    }

    #[test]
    fn test_find_bool_spellings() {
        let mut config = MethodConfig::default();
        config.set("a", "true");
        config.set("b", "No");
        config.set("c", "1");
        config.set("d", "garbage");
        assert!(config.find_bool("a", false));
        assert!(!config.find_bool("b", true));
        assert!(config.find_bool("c", false));
        assert!(config.find_bool("d", true));
        assert!(!config.find_bool("missing", false));
    }

    #[test]
    fn test_merge_message() {
        let mut message = Message::new(601, "Configuration");
        message.push_field("Config-Item", "Debug::Acquire::gpgv=true");
        message.push_field("Config-Item", "Dir::Bin::gpgv=/usr/bin/gpgv");
        message.push_field("Config-Item", "not-an-assignment");

        let mut config = MethodConfig::default();
        config.merge_message(&message);
        assert!(config.find_bool("Debug::Acquire::gpgv", false));
        assert_eq!(config.find("Dir::Bin::gpgv"), Some("/usr/bin/gpgv"));
    }
}

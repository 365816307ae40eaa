// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The string-to-string option bag accepted by migration calls.
//!
//! Boolean options share one grammar: `true`/`on`/`1` are truthy and
//! `false`/`off`/`0` are falsy, case-insensitively.  Anything else is an
//! invalid value, not a silent default.

use super::Error;
use std::collections::BTreeMap;

/// Option keys recognized by the migration engine.
pub const OPTION_COMPRESS: &str = "compress";
pub const OPTION_COPY: &str = "copy";
pub const OPTION_FORCE: &str = "force";
pub const OPTION_NETWORK: &str = "network";
/// Injected by the API dispatcher for `VDI.pool_migrate`; never supplied
/// by external callers.
pub const OPTION_INTERNAL_VM: &str = "__internal__vm";

/// Parses a boolean option, returning `None` when the key is absent.
pub fn bool_option(
    options: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<bool>, Error> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" => Ok(Some(true)),
        "false" | "off" | "0" => Ok(Some(false)),
        other => Err(Error::invalid_value(
            key,
            format!("expected a boolean, got {:?}", other),
        )),
    }
}

/// Like [`bool_option`] but with an explicit default for absent keys.
pub fn bool_option_or(
    options: &BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, Error> {
    Ok(bool_option(options, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn boolean_grammar() {
        for truthy in ["true", "TRUE", "on", "On", "1"] {
            let b = bag(&[("force", truthy)]);
            assert_eq!(bool_option(&b, "force").unwrap(), Some(true));
        }
        for falsy in ["false", "False", "off", "OFF", "0"] {
            let b = bag(&[("force", falsy)]);
            assert_eq!(bool_option(&b, "force").unwrap(), Some(false));
        }
        assert_eq!(bool_option(&bag(&[]), "force").unwrap(), None);
        assert!(bool_option(&bag(&[("force", "yes")]), "force").is_err());
        assert!(bool_option_or(&bag(&[]), "copy", false).unwrap() == false);
    }
}

//! Rule-table construction from an INI document.
//!
//! Each section is one rule: the header text encodes the operation, the body
//! holds the budget parameters. Section order is rule precedence.
//!
//! ```ini
//! [default]
//! creditLimit = 10
//! resetSeconds = 60
//!
//! [method=GET path=/ping* ip=*]
//! creditLimit = 100
//! resetSeconds = 60
//! actorField = ip
//! comment = ping throttle
//! ```

use std::path::Path;

use ini::{Ini, Properties};

use crate::error::ConfigError;
use crate::rules::{Rule, RuleTable};

/// Load a rule table from a file on disk.
pub fn load_rules(path: impl AsRef<Path>) -> Result<RuleTable, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_rules(&text)
}

/// Parse a rule table from INI text.
pub fn parse_rules(text: &str) -> Result<RuleTable, ConfigError> {
    let document = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut table = RuleTable::new();
    for (section, body) in document.iter() {
        // Properties outside any section cannot describe a rule.
        let Some(header) = section else { continue };
        table.add_rule(rule_from_section(header, body)?)?;
    }
    Ok(table)
}

fn rule_from_section(header: &str, body: &Properties) -> Result<Rule, ConfigError> {
    let rule = parse_header(header)?
        .with_credit_limit(int_param(body, "creditLimit"))
        .with_reset_seconds(int_param(body, "resetSeconds"))
        .with_actor_field(body.get("actorField").unwrap_or(""));
    match body.get("comment") {
        Some(comment) => Ok(rule.with_comment(comment)),
        None => Ok(rule),
    }
}

/// Parse a section header: the literal `default`, or whitespace-separated
/// `key=value` tokens. A token without `=` is a key with an empty value.
fn parse_header(header: &str) -> Result<Rule, ConfigError> {
    let header = header.trim();
    if header == "default" {
        return Ok(Rule::default_rule());
    }
    let mut pairs = Vec::new();
    for token in header.split_whitespace() {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        if key.is_empty() {
            return Err(ConfigError::Parse(format!(
                "section [{}]: label name missing in token \"{}\"",
                header, token
            )));
        }
        pairs.push((key, value));
    }
    Ok(Rule::new(pairs))
}

/// Integer body parameter; absent or unparseable values fall back to 0.
fn int_param(body: &Properties, key: &str) -> u64 {
    body.get(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

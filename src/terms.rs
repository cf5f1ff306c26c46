//! Naming convention for balance-affecting variables.
//!
//! `alice.balance` is the balance of account `alice` before the transition and
//! `alice.balance'` the balance after it.

use regex::Regex;
use std::sync::OnceLock;

/// A variable recognised as an account balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceTerm {
    pub account: String,
    /// True for the post-state (primed) balance.
    pub post: bool,
}

static BALANCE_RE: OnceLock<Regex> = OnceLock::new();

fn get_balance_re() -> &'static Regex {
    BALANCE_RE.get_or_init(|| {
        Regex::new(r"^(?P<account>[A-Za-z0-9_:\-]+)\.balance(?P<post>')?$").expect("valid regex")
    })
}

/// Classify `name` as a balance variable, if it is one.
pub fn parse_balance_term(name: &str) -> Option<BalanceTerm> {
    let caps = get_balance_re().captures(name)?;
    Some(BalanceTerm {
        account: caps.name("account")?.as_str().to_string(),
        post: caps.name("post").is_some(),
    })
}

pub fn is_balance_var(name: &str) -> bool {
    parse_balance_term(name).is_some()
}

pub fn is_post_balance_var(name: &str) -> bool {
    parse_balance_term(name).is_some_and(|t| t.post)
}

pub fn pre_balance_var(account: &str) -> String {
    format!("{account}.balance")
}

pub fn post_balance_var(account: &str) -> String {
    format!("{account}.balance'")
}

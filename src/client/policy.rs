//! Spending policy consulted before any on-chain action.

use std::fmt;

/// Result of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the payment may proceed.
    pub allow: bool,
    /// Human-readable explanation.
    pub reason: String,
}

impl PolicyDecision {
    /// An approving decision.
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    /// A refusing decision.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

/// Decides whether the client may pay `amount` lamports to `host`.
///
/// `host` is the URL authority, including a port if one was given.
pub trait PolicyGuard: Send + Sync {
    /// Authorize or refuse a payment.
    fn authorize(&self, host: &str, amount: u64) -> PolicyDecision;
}

/// Approves every payment.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PolicyGuard for AllowAll {
    fn authorize(&self, _host: &str, _amount: u64) -> PolicyDecision {
        PolicyDecision::allow("All payments allowed")
    }
}

/// Per-task budget plus a host whitelist.
///
/// A whitelisted host also admits its subdomains: `example.com` admits
/// `api.example.com` but not `badexample.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBudgetPolicy {
    /// Largest amount a single payment may carry.
    pub max_lamports_per_task: u64,
    /// Hosts payments may go to.
    pub whitelist_hosts: Vec<String>,
}

impl Default for HostBudgetPolicy {
    fn default() -> Self {
        Self {
            max_lamports_per_task: 500_000,
            whitelist_hosts: vec!["localhost:3000".to_string()],
        }
    }
}

impl HostBudgetPolicy {
    /// Parse a comma-separated host list, skipping blanks.
    #[must_use]
    pub fn parse_hosts(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn is_whitelisted(&self, host: &str) -> bool {
        self.whitelist_hosts.iter().any(|allowed| {
            host == allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl PolicyGuard for HostBudgetPolicy {
    fn authorize(&self, host: &str, amount: u64) -> PolicyDecision {
        if amount > self.max_lamports_per_task {
            return PolicyDecision::deny(format!(
                "Amount {amount} exceeds max budget {}",
                self.max_lamports_per_task
            ));
        }

        if !self.is_whitelisted(host) {
            return PolicyDecision::deny(format!(
                "Host {host} not in whitelist: {}",
                self.whitelist_hosts.join(", ")
            ));
        }

        PolicyDecision::allow("Payment authorized by policy")
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allow { "allowed" } else { "denied" };
        write!(f, "{verdict}: {}", self.reason)
    }
}

//! Per-tool capability policy.

use std::collections::HashMap;

/// Capability level required by a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityTier {
    /// Read-only: listings, bounded reads, searches, memory queries.
    Safe = 0,
    /// Side effects inside the sandbox: edits, bounded runs, bounded spawns.
    Moderate = 1,
    /// Arbitrary shell, network, deletion. Always requires approval.
    Dangerous = 2,
}

impl std::fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Moderate => write!(f, "moderate"),
            Self::Dangerous => write!(f, "dangerous"),
        }
    }
}

/// Policy for one tool name.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    pub tier: CapabilityTier,
    pub requires_approval: bool,
    pub sandboxed: bool,
    /// For network tools: permitted destination hosts.
    pub allow_domains: Option<Vec<String>>,
    /// Payload / read size ceiling in bytes.
    pub max_bytes: Option<usize>,
    pub timeout_s: u64,
}

impl ToolPolicy {
    fn new(tier: CapabilityTier) -> Self {
        Self {
            tier,
            requires_approval: tier == CapabilityTier::Dangerous,
            sandboxed: false,
            allow_domains: None,
            max_bytes: Some(DEFAULT_PAYLOAD_CAP),
            timeout_s: 30,
        }
    }

    fn sandboxed(mut self) -> Self {
        self.sandboxed = true;
        self
    }

    fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_s = seconds;
        self
    }
}

/// Cap on a single file read.
pub const DEFAULT_READ_CAP: usize = 1024 * 1024;

/// Cap on an individual action payload.
pub const DEFAULT_PAYLOAD_CAP: usize = 64 * 1024;

/// Mapping from tool name to policy. Unknown tools escalate by default.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    tools: HashMap<String, ToolPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use CapabilityTier::*;
        let mut tools = HashMap::new();

        tools.insert("list_files".into(), ToolPolicy::new(Safe).sandboxed());
        tools.insert(
            "read_file".into(),
            ToolPolicy::new(Safe).sandboxed().max_bytes(DEFAULT_READ_CAP),
        );
        tools.insert("search_text".into(), ToolPolicy::new(Safe).sandboxed());
        tools.insert("write_memory".into(), ToolPolicy::new(Safe));
        tools.insert("orch_status".into(), ToolPolicy::new(Safe));
        tools.insert("done".into(), ToolPolicy::new(Safe));
        tools.insert(
            "edit_file".into(),
            ToolPolicy::new(Moderate).sandboxed(),
        );
        tools.insert("run".into(), ToolPolicy::new(Moderate).timeout(120));
        tools.insert(
            "spawn_daemon".into(),
            ToolPolicy::new(Moderate).timeout(600),
        );
        tools.insert("exec".into(), ToolPolicy::new(Dangerous).timeout(120));
        tools.insert("http_request".into(), ToolPolicy::new(Dangerous));

        Self { tools }
    }
}

impl PolicyTable {
    /// Look up a tool. Unknown names return `None`; the guard escalates.
    pub fn get(&self, tool: &str) -> Option<&ToolPolicy> {
        self.tools.get(tool)
    }

    /// Replace or add a tool policy.
    pub fn set(&mut self, tool: impl Into<String>, policy: ToolPolicy) {
        self.tools.insert(tool.into(), policy);
    }

    /// Restrict a network tool to specific hosts.
    pub fn allow_domains(&mut self, tool: &str, domains: Vec<String>) {
        if let Some(policy) = self.tools.get_mut(tool) {
            policy.allow_domains = Some(domains);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_tiers() {
        let table = PolicyTable::default();
        assert_eq!(table.get("read_file").unwrap().tier, CapabilityTier::Safe);
        assert_eq!(table.get("edit_file").unwrap().tier, CapabilityTier::Moderate);
        assert_eq!(table.get("exec").unwrap().tier, CapabilityTier::Dangerous);
        assert!(table.get("exec").unwrap().requires_approval);
        assert!(table.get("mystery_tool").is_none());
    }

    #[test]
    fn test_read_cap_larger_than_payload_cap() {
        let table = PolicyTable::default();
        assert_eq!(table.get("read_file").unwrap().max_bytes, Some(DEFAULT_READ_CAP));
        assert_eq!(
            table.get("edit_file").unwrap().max_bytes,
            Some(DEFAULT_PAYLOAD_CAP)
        );
    }

    #[test]
    fn test_tier_ordering() {
        assert!(CapabilityTier::Safe < CapabilityTier::Moderate);
        assert!(CapabilityTier::Moderate < CapabilityTier::Dangerous);
    }
}

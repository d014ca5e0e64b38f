// ABOUTME: Tool set computation for agent runs
// ABOUTME: The effective set is the catalog narrowed by the allow list, minus the deny list

use std::collections::BTreeSet;

/// catalog ∩ allowed (when allowed is non-empty), minus disallowed
pub fn effective_tools(
    catalog: &BTreeSet<String>,
    allowed: &BTreeSet<String>,
    disallowed: &BTreeSet<String>,
) -> BTreeSet<String> {
    catalog
        .iter()
        .filter(|tool| allowed.is_empty() || allowed.contains(*tool))
        .filter(|tool| !disallowed.contains(*tool))
        .cloned()
        .collect()
}

/// An explicit allow list, or the engine-wide switch, makes an empty set fatal
pub fn tools_required(allowed: &BTreeSet<String>, require_tools: bool) -> bool {
    require_tools || !allowed.is_empty()
}

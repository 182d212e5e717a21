// Inbound replication filtering.
//
// Remote peers can ask this client to set any variable or call any function
// on any node path. In protection mode, only explicitly exposed targets are
// honored; everything else is dropped (and logged) before the game sees it.
// The registries are purely local — the server relays traffic unfiltered.

use std::collections::BTreeSet;

/// Exposure registries consulted for every inbound var write and function
/// call. With protection mode off (the default) everything is allowed.
pub struct SecurityRegistry {
    protection: bool,
    exposed_nodes: BTreeSet<String>,
    exposed_vars: BTreeSet<(String, String)>,
    exposed_functions: BTreeSet<(String, String)>,
}

impl SecurityRegistry {
    pub fn new() -> Self {
        Self {
            protection: false,
            exposed_nodes: BTreeSet::new(),
            exposed_vars: BTreeSet::new(),
            exposed_functions: BTreeSet::new(),
        }
    }

    pub fn set_protection_mode(&mut self, enabled: bool) {
        self.protection = enabled;
    }

    pub fn protection_mode(&self) -> bool {
        self.protection
    }

    /// Expose every variable and function on a node.
    pub fn expose_node(&mut self, node_path: &str) {
        self.exposed_nodes.insert(node_path.to_string());
    }

    pub fn hide_node(&mut self, node_path: &str) {
        self.exposed_nodes.remove(node_path);
    }

    pub fn expose_var(&mut self, node_path: &str, variable: &str) {
        self.exposed_vars
            .insert((node_path.to_string(), variable.to_string()));
    }

    pub fn hide_var(&mut self, node_path: &str, variable: &str) {
        self.exposed_vars
            .remove(&(node_path.to_string(), variable.to_string()));
    }

    pub fn expose_function(&mut self, node_path: &str, function: &str) {
        self.exposed_functions
            .insert((node_path.to_string(), function.to_string()));
    }

    pub fn hide_function(&mut self, node_path: &str, function: &str) {
        self.exposed_functions
            .remove(&(node_path.to_string(), function.to_string()));
    }

    pub fn allows_var(&self, node_path: &str, variable: &str) -> bool {
        !self.protection
            || self.exposed_nodes.contains(node_path)
            || self
                .exposed_vars
                .contains(&(node_path.to_string(), variable.to_string()))
    }

    pub fn allows_function(&self, node_path: &str, function: &str) -> bool {
        !self.protection
            || self.exposed_nodes.contains(node_path)
            || self
                .exposed_functions
                .contains(&(node_path.to_string(), function.to_string()))
    }
}

impl Default for SecurityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn everything_allowed_without_protection() {
        let registry = SecurityRegistry::new();
        assert!(registry.allows_var("world/player", "health"));
        assert!(registry.allows_function("world/player", "respawn"));
    }

    #[test]
    fn protection_blocks_unexposed_targets() {
        let mut registry = SecurityRegistry::new();
        registry.set_protection_mode(true);
        assert!(!registry.allows_var("world/player", "health"));
        assert!(!registry.allows_function("world/player", "respawn"));
    }

    #[test]
    fn exposed_var_is_allowed_but_not_siblings() {
        let mut registry = SecurityRegistry::new();
        registry.set_protection_mode(true);
        registry.expose_var("world/player", "health");
        assert!(registry.allows_var("world/player", "health"));
        assert!(!registry.allows_var("world/player", "position"));
        assert!(!registry.allows_function("world/player", "health"));

        registry.hide_var("world/player", "health");
        assert!(!registry.allows_var("world/player", "health"));
    }

    #[test]
    fn exposed_node_allows_everything_on_it() {
        let mut registry = SecurityRegistry::new();
        registry.set_protection_mode(true);
        registry.expose_node("world/door");
        assert!(registry.allows_var("world/door", "open"));
        assert!(registry.allows_function("world/door", "toggle"));
        assert!(!registry.allows_var("world/window", "open"));

        registry.hide_node("world/door");
        assert!(!registry.allows_var("world/door", "open"));
    }
}

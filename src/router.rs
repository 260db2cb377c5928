//! Command routing
//!
//! Maps a command name to the daemon service that owns it.

use std::collections::HashMap;

/// Resolves the destination service of a command.
pub trait CommandRouter: Send + Sync {
    fn destination(&self, command: &str) -> Option<String>;
}

/// Table-backed router.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    routes: HashMap<String, String>,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, command: impl Into<String>, service: impl Into<String>) -> Self {
        self.routes.insert(command.into(), service.into());
        self
    }

    /// Route every command in `commands` to `service`.
    pub fn with_service<I, S>(mut self, service: &str, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for command in commands {
            self.routes.insert(command.into(), service.to_string());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<C: Into<String>, S: Into<String>> FromIterator<(C, S)> for StaticRouter {
    fn from_iter<T: IntoIterator<Item = (C, S)>>(iter: T) -> Self {
        Self {
            routes: iter
                .into_iter()
                .map(|(command, service)| (command.into(), service.into()))
                .collect(),
        }
    }
}

impl CommandRouter for StaticRouter {
    fn destination(&self, command: &str) -> Option<String> {
        self.routes.get(command).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_routes() {
        let router = StaticRouter::new()
            .with_route("ping", "daemon")
            .with_service("wallet", ["get_balance", "send_tx"]);

        assert_eq!(router.destination("ping").as_deref(), Some("daemon"));
        assert_eq!(router.destination("send_tx").as_deref(), Some("wallet"));
        assert_eq!(router.destination("missing"), None);
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn test_from_iter() {
        let router: StaticRouter = [("a", "x"), ("b", "y")].into_iter().collect();
        assert_eq!(router.destination("b").as_deref(), Some("y"));
    }
}

//! Case-insensitive command lookup.

use std::collections::HashMap;
use std::sync::Arc;

use cmdpipe_core::error::{PipeError, Result};

use crate::command::{CommandRef, Immediate};
use crate::commands;
use crate::keyspace::Keyspace;

#[derive(Debug, Default)]
pub struct Registry {
    commands: HashMap<String, CommandRef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in commands over `keyspace`.
    pub fn with_builtins(keyspace: &Arc<Keyspace>) -> Result<Self> {
        let mut registry = Self::new();
        commands::register_builtins(&mut registry, keyspace)?;
        Ok(registry)
    }

    /// Add a command prototype. Names are unique regardless of case.
    pub fn register(&mut self, prototype: CommandRef) -> Result<()> {
        let name = prototype.name().to_ascii_uppercase();
        if self.commands.contains_key(&name) {
            return Err(PipeError::DuplicateCommand(name));
        }
        self.commands.insert(name, prototype);
        Ok(())
    }

    pub fn lookup(&self, name: &[u8]) -> Option<&CommandRef> {
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        self.commands.get(&name)
    }

    /// Parse `args` into a command, or an error command if none matches.
    pub fn resolve(&self, args: &[&[u8]]) -> CommandRef {
        let Some(name) = args.first() else {
            return Immediate::error("ERR empty command");
        };
        match self.lookup(name) {
            Some(prototype) => prototype.parse(args),
            None => Immediate::error(format!(
                "ERR command '{}' not found",
                String::from_utf8_lossy(name)
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::execute;
    use crate::commands::Ping;
    use cmdpipe_resp::Reply;

    #[test]
    fn test_builtins_resolve_any_case() {
        let registry = Registry::with_builtins(&Arc::new(Keyspace::new())).unwrap();
        assert_eq!(registry.names(), vec!["DEL", "ECHO", "GET", "PING", "SET", "SLEEP"]);

        let ping = registry.resolve(&[b"ping"]);
        assert_eq!(execute(&*ping), Reply::pong());

        let sleep = registry.resolve(&[b"SlEeP", b"1"]);
        assert!(sleep.is_worker());
    }

    #[test]
    fn test_unknown_command() {
        let registry = Registry::new();
        let cmd = registry.resolve(&[b"nosuch", b"x"]);
        assert!(cmd.is_error());
        assert_eq!(execute(&*cmd), Reply::error("ERR command 'nosuch' not found"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Ping::default())).unwrap();
        let err = registry.register(Arc::new(Ping::default())).unwrap_err();
        assert!(matches!(err, PipeError::DuplicateCommand(ref n) if n == "PING"));
        assert_eq!(registry.len(), 1);
    }
}

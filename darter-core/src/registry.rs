//! Runtime command metadata registry.
//!
//! The coordinator resolves every incoming command name to a [`CommandId`]
//! before building a transaction; key positions and option bits drive
//! argument distribution and lock-mode selection downstream.

use darter_common::error::{DarterError, DarterResult};

use crate::command::{CommandId, opt};
use crate::containers::HotMap;

/// Command metadata table keyed by canonical uppercase name.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    entries: HotMap<String, CommandId>,
}

impl CommandRegistry {
    /// Builds an empty command registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HotMap::new(),
        }
    }

    /// Builds a registry preloaded with the built-in command table.
    #[must_use]
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        registry.register_string_commands();
        registry.register_list_commands();
        registry.register_sorted_set_commands();
        registry.register_scripting_commands();
        registry.register_server_commands();
        registry
    }

    fn register_string_commands(&mut self) {
        self.register(CommandId::new("GET", opt::READONLY, 1, 1, 1));
        self.register(CommandId::new("SET", opt::WRITE, 1, 1, 1));
        self.register(CommandId::new("GETSET", opt::WRITE, 1, 1, 1));
        self.register(CommandId::new("INCR", opt::WRITE, 1, 1, 1));
        self.register(CommandId::new(
            "MGET",
            opt::READONLY | opt::REVERSE_MAPPING,
            1,
            -1,
            1,
        ));
        self.register(CommandId::new("MSET", opt::WRITE, 1, -1, 2));
        self.register(CommandId::new("DEL", opt::WRITE, 1, -1, 1));
        self.register(CommandId::new("UNLINK", opt::WRITE, 1, -1, 1));
        self.register(CommandId::new("EXISTS", opt::READONLY, 1, -1, 1));
        self.register(CommandId::new("RENAME", opt::WRITE, 1, 2, 1));
    }

    fn register_list_commands(&mut self) {
        self.register(CommandId::new("LPUSH", opt::WRITE, 1, 1, 1));
        self.register(CommandId::new("RPUSH", opt::WRITE, 1, 1, 1));
        self.register(CommandId::new("LPOP", opt::WRITE, 1, 1, 1));
        self.register(CommandId::new("RPOP", opt::WRITE, 1, 1, 1));
        // Trailing timeout argument keeps the key range at -2.
        self.register(CommandId::new("BLPOP", opt::WRITE, 1, -2, 1));
        self.register(CommandId::new("BRPOP", opt::WRITE, 1, -2, 1));
    }

    fn register_sorted_set_commands(&mut self) {
        self.register(CommandId::new(
            "ZUNIONSTORE",
            opt::WRITE | opt::VARIADIC_KEYS,
            3,
            3,
            1,
        ));
        self.register(CommandId::new(
            "ZINTERSTORE",
            opt::WRITE | opt::VARIADIC_KEYS,
            3,
            3,
            1,
        ));
    }

    fn register_scripting_commands(&mut self) {
        self.register(CommandId::new(
            "EVAL",
            opt::WRITE | opt::VARIADIC_KEYS,
            3,
            3,
            1,
        ));
        self.register(CommandId::new(
            "EVALSHA",
            opt::WRITE | opt::VARIADIC_KEYS,
            3,
            3,
            1,
        ));
        self.register(CommandId::new("EXEC", opt::NO_AUTOJOURNAL, 0, 0, 1));
    }

    fn register_server_commands(&mut self) {
        self.register(CommandId::new(
            "FLUSHDB",
            opt::WRITE | opt::GLOBAL_TRANS,
            0,
            0,
            1,
        ));
        self.register(CommandId::new(
            "FLUSHALL",
            opt::WRITE | opt::GLOBAL_TRANS,
            0,
            0,
            1,
        ));
        self.register(CommandId::new(
            "DBSIZE",
            opt::READONLY | opt::GLOBAL_TRANS,
            0,
            0,
            1,
        ));
    }

    /// Registers or replaces one command in the table.
    pub fn register(&mut self, cid: CommandId) {
        let _ = self.entries.insert(cid.name().to_owned(), cid);
    }

    /// Resolves a command name to its metadata, case-insensitively.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<CommandId> {
        self.entries.get(&name.to_ascii_uppercase()).copied()
    }

    /// Resolves a command name, surfacing a user-facing error for unknown
    /// names.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` when no command is registered under
    /// `name`.
    pub fn require(&self, name: &str) -> DarterResult<CommandId> {
        self.find(name)
            .ok_or_else(|| DarterError::Protocol(format!("unknown command '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::CommandRegistry;
    use crate::command::opt;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn lookup_is_case_insensitive() {
        let registry = CommandRegistry::with_builtin_commands();
        let lower = registry.find("mset").expect("MSET must be registered");
        let upper = registry.find("MSET").expect("MSET must be registered");
        assert_that!(lower, eq(upper));
        assert_that!(lower.key_arg_step(), eq(2_u32));
    }

    #[rstest]
    fn global_commands_carry_the_global_flag() {
        let registry = CommandRegistry::with_builtin_commands();
        let flushdb = registry.find("FLUSHDB").expect("FLUSHDB must be registered");
        assert_that!(flushdb.has_flag(opt::GLOBAL_TRANS | opt::WRITE), eq(true));
        assert_that!(flushdb.first_key_pos(), eq(0_u32));
    }

    #[rstest]
    fn blocking_list_commands_exclude_the_timeout_argument() {
        let registry = CommandRegistry::with_builtin_commands();
        let blpop = registry.find("BLPOP").expect("BLPOP must be registered");
        assert_that!(blpop.last_key_pos(), eq(-2_i32));
    }

    #[rstest]
    fn unknown_command_resolves_to_none() {
        let registry = CommandRegistry::with_builtin_commands();
        assert_that!(registry.find("NOPE").is_none(), eq(true));

        let Err(error) = registry.require("NOPE") else {
            panic!("unknown command must not resolve");
        };
        assert_that!(
            error.to_string(),
            eq("protocol error: unknown command 'NOPE'")
        );
    }
}

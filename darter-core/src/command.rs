//! Canonical command frame and command metadata types.

/// Command option bits carried by [`CommandId::opt_mask`].
pub mod opt {
    /// Command only reads keys; it takes shared locks.
    pub const READONLY: u32 = 1;
    /// Command mutates keys; it takes exclusive locks and is auto-journaled.
    pub const WRITE: u32 = 1 << 1;
    /// Command owns the whole keyspace and schedules via shard intent locks.
    pub const GLOBAL_TRANS: u32 = 1 << 2;
    /// Key count is declared inside the argument vector (`ZUNIONSTORE`, `EVAL`).
    pub const VARIADIC_KEYS: u32 = 1 << 3;
    /// Callbacks need to map shard-local argument positions back to the
    /// caller's original positions.
    pub const REVERSE_MAPPING: u32 = 1 << 4;
    /// Command journals explicitly; the concluding-hop auto entry is skipped.
    pub const NO_AUTOJOURNAL: u32 = 1 << 5;
}

/// Command payload representation handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command name in uppercase canonical form (e.g. `SET`, `MGET`).
    pub name: String,
    /// Raw byte arguments preserving wire-level payload.
    pub args: Vec<Vec<u8>>,
}

impl CommandFrame {
    /// Creates a command frame from a command name and argument list.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Returns the full argument vector including the command name at
    /// position zero, the layout key positions are counted against.
    #[must_use]
    pub fn full_args(&self) -> Vec<Vec<u8>> {
        let mut full = Vec::with_capacity(self.args.len() + 1);
        full.push(self.name.clone().into_bytes());
        full.extend(self.args.iter().cloned());
        full
    }
}

/// Metadata handle for one registered command.
///
/// Key positions are counted within the full argument vector, so position
/// zero is the command name and the first possible key sits at position one.
/// A non-positive `last_key_pos` is relative to the vector tail (`-1` means
/// "the last argument is a key", `-2` leaves one trailing non-key argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandId {
    name: &'static str,
    opt_mask: u32,
    first_key_pos: u32,
    last_key_pos: i32,
    key_arg_step: u32,
}

impl CommandId {
    /// Creates a command metadata entry.
    #[must_use]
    pub const fn new(
        name: &'static str,
        opt_mask: u32,
        first_key_pos: u32,
        last_key_pos: i32,
        key_arg_step: u32,
    ) -> Self {
        Self {
            name,
            opt_mask,
            first_key_pos,
            last_key_pos,
            key_arg_step,
        }
    }

    /// Canonical uppercase command name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Raw option mask.
    #[must_use]
    pub const fn opt_mask(&self) -> u32 {
        self.opt_mask
    }

    /// Returns whether all bits of `flags` are set on this command.
    #[must_use]
    pub const fn has_flag(&self, flags: u32) -> bool {
        self.opt_mask & flags == flags
    }

    /// Position of the first key inside the full argument vector.
    #[must_use]
    pub const fn first_key_pos(&self) -> u32 {
        self.first_key_pos
    }

    /// Position of the last key; non-positive values count from the tail.
    #[must_use]
    pub const fn last_key_pos(&self) -> i32 {
        self.last_key_pos
    }

    /// Stride between keys (`2` for key/value pair commands like `MSET`).
    #[must_use]
    pub const fn key_arg_step(&self) -> u32 {
        self.key_arg_step
    }

    /// Returns whether this command opens a multi-command transaction shell.
    #[must_use]
    pub fn is_multi_shell(&self) -> bool {
        matches!(self.name, "EXEC" | "EVAL" | "EVALSHA")
    }
}

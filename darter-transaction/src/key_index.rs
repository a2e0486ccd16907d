//! Key range derivation from command metadata.

use darter_core::command::{CommandId, opt};
use darter_core::status::{OpResult, OpStatus};

/// Resolved key positions inside a full argument vector.
///
/// `start..end` covers the key range (values included for step-two
/// commands); `bonus` is an optional out-of-range destination key, like the
/// target of a `Z…STORE` command, that must still be counted for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndex {
    /// First key position.
    pub start: usize,
    /// One past the last argument belonging to the key range.
    pub end: usize,
    /// Stride between keys (2 for key/value pairs).
    pub step: usize,
    /// Optional destination key outside the range.
    pub bonus: Option<usize>,
}

impl KeyIndex {
    /// Builds a step-one range over `start..end` with no bonus key.
    #[must_use]
    pub fn range(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            step: 1,
            bonus: None,
        }
    }

    /// The empty index used by global transactions.
    #[must_use]
    pub fn empty() -> Self {
        Self::range(0, 0)
    }

    /// Returns whether the range covers exactly one key.
    ///
    /// A single key may still span several arguments (`MSET k v`).
    #[must_use]
    pub fn has_single_key(&self) -> bool {
        self.bonus.is_none() && self.start + self.step >= self.end
    }

    /// Number of arguments covered by the range and the bonus key.
    #[must_use]
    pub fn num_args(&self) -> usize {
        self.end - self.start + usize::from(self.bonus.is_some())
    }
}

/// Computes the key range for `cid` over the full argument vector
/// (command name at position zero).
///
/// Commands with fixed metadata use `(first_key_pos, last_key_pos, step)`;
/// a non-positive last position counts from the vector tail. Variadic
/// commands declare their key count inside the vector: position 2 for
/// `EVAL`-family commands, right after the bonus key otherwise.
///
/// # Errors
///
/// Returns [`OpStatus::InvalidInt`] when the declared key count does not
/// parse, and [`OpStatus::SyntaxErr`] when the count is missing, exceeds the
/// vector, or the resolved range does not fit the arguments.
pub fn determine_keys(cid: &CommandId, args: &[Vec<u8>]) -> OpResult<KeyIndex> {
    if cid.has_flag(opt::GLOBAL_TRANS) {
        return Ok(KeyIndex::empty());
    }

    let mut bonus = None;
    let mut num_custom_keys = None;

    if cid.has_flag(opt::VARIADIC_KEYS) {
        // ZUNIONSTORE <dest> <num_keys> <key1> […] / EVAL <script> <num_keys> […]
        if args.len() < 3 {
            return Err(OpStatus::SyntaxErr);
        }

        if cid.name().ends_with("STORE") {
            bonus = Some(1);
        }

        let num_keys_index = if cid.name().starts_with("EVAL") {
            2
        } else {
            bonus.unwrap_or(0) + 1
        };

        let declared = std::str::from_utf8(&args[num_keys_index])
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or(OpStatus::InvalidInt)?;

        if args.len() < declared + num_keys_index + 1 {
            return Err(OpStatus::SyntaxErr);
        }
        num_custom_keys = Some(declared);
    }

    if cid.first_key_pos() > 0 {
        let start = cid.first_key_pos() as usize;
        let end = match num_custom_keys {
            Some(count) => start + count,
            None => {
                let last = i64::from(cid.last_key_pos());
                let end = if last > 0 {
                    last + 1
                } else {
                    i64::try_from(args.len()).unwrap_or(i64::MAX) + 1 + last
                };
                usize::try_from(end).map_err(|_| OpStatus::SyntaxErr)?
            }
        };

        if end > args.len() || start > end {
            return Err(OpStatus::SyntaxErr);
        }
        return Ok(KeyIndex {
            start,
            end,
            step: cid.key_arg_step() as usize,
            bonus,
        });
    }

    Err(OpStatus::SyntaxErr)
}

#[cfg(test)]
mod tests {
    use super::{KeyIndex, determine_keys};
    use darter_core::registry::CommandRegistry;
    use darter_core::status::OpStatus;
    use googletest::prelude::*;
    use rstest::rstest;

    fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    #[rstest]
    fn set_resolves_its_single_key() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("SET").expect("SET must be registered");
        let index =
            determine_keys(&cid, &argv(&["SET", "k", "v"])).expect("SET shape must be valid");

        assert_that!(index, eq(KeyIndex::range(1, 2)));
        assert_that!(index.has_single_key(), eq(true));
    }

    #[rstest]
    fn mset_covers_pairs_with_step_two() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("MSET").expect("MSET must be registered");
        let index = determine_keys(&cid, &argv(&["MSET", "a", "1", "b", "2", "c", "3"]))
            .expect("MSET shape must be valid");

        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(7_usize));
        assert_that!(index.step, eq(2_usize));
        assert_that!(index.has_single_key(), eq(false));
        assert_that!(index.num_args(), eq(6_usize));
    }

    #[rstest]
    fn single_pair_mset_counts_as_one_key() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("MSET").expect("MSET must be registered");
        let index =
            determine_keys(&cid, &argv(&["MSET", "k", "v"])).expect("MSET shape must be valid");
        assert_that!(index.has_single_key(), eq(true));
    }

    #[rstest]
    fn blpop_leaves_the_trailing_timeout_out_of_the_range() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("BLPOP").expect("BLPOP must be registered");
        let index = determine_keys(&cid, &argv(&["BLPOP", "q1", "q2", "5"]))
            .expect("BLPOP shape must be valid");

        assert_that!(index.start, eq(1_usize));
        assert_that!(index.end, eq(3_usize));
    }

    #[rstest]
    fn zunionstore_declares_count_and_destination() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry
            .find("ZUNIONSTORE")
            .expect("ZUNIONSTORE must be registered");
        let index = determine_keys(&cid, &argv(&["ZUNIONSTORE", "dest", "2", "z1", "z2"]))
            .expect("shape must be valid");

        assert_that!(index.bonus, eq(Some(1_usize)));
        assert_that!(index.start, eq(3_usize));
        assert_that!(index.end, eq(5_usize));
        assert_that!(index.num_args(), eq(3_usize));
    }

    #[rstest]
    fn eval_reads_the_count_at_position_two() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("EVAL").expect("EVAL must be registered");
        let index = determine_keys(&cid, &argv(&["EVAL", "return 1", "1", "k", "extra"]))
            .expect("shape must be valid");

        assert_that!(index.bonus, eq(None));
        assert_that!(index.start, eq(3_usize));
        assert_that!(index.end, eq(4_usize));
    }

    #[rstest]
    fn eval_with_zero_keys_yields_an_empty_range() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("EVAL").expect("EVAL must be registered");
        let index =
            determine_keys(&cid, &argv(&["EVAL", "return 1", "0"])).expect("shape must be valid");
        assert_that!(index.start, eq(index.end));
    }

    #[rstest]
    #[case(&["ZUNIONSTORE", "dest"], OpStatus::SyntaxErr)]
    #[case(&["ZUNIONSTORE", "dest", "two", "z1", "z2"], OpStatus::InvalidInt)]
    #[case(&["ZUNIONSTORE", "dest", "-1", "z1"], OpStatus::InvalidInt)]
    #[case(&["ZUNIONSTORE", "dest", "3", "z1", "z2"], OpStatus::SyntaxErr)]
    fn variadic_count_errors(#[case] parts: &[&str], #[case] expected: OpStatus) {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry
            .find("ZUNIONSTORE")
            .expect("ZUNIONSTORE must be registered");
        let result = determine_keys(&cid, &argv(parts));
        assert_that!(result, eq(Err(expected)));
    }

    #[rstest]
    fn global_commands_get_an_empty_index() {
        let registry = CommandRegistry::with_builtin_commands();
        let cid = registry.find("FLUSHDB").expect("FLUSHDB must be registered");
        let index = determine_keys(&cid, &argv(&["FLUSHDB"])).expect("shape must be valid");
        assert_that!(index, eq(KeyIndex::empty()));
        assert_that!(index.num_args(), eq(0_usize));
    }
}

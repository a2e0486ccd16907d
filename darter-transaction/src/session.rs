//! Connection-scoped MULTI queue state.
//!
//! Transaction intent lives at the client-connection level first: `MULTI`
//! opens a queue, sub-commands accumulate, and `EXEC` hands the whole batch
//! to the coordinator. This module models that first stage so server code
//! stays explicit and testable.

use darter_core::command::CommandFrame;

/// What `EXEC` should do with the queued batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Run the queued commands as one transaction.
    Run(Vec<CommandFrame>),
    /// Abort: a queueing error poisoned the batch.
    Abort,
}

/// Mutable transaction state attached to one client connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionSession {
    in_multi: bool,
    queued_commands: Vec<CommandFrame>,
    queue_error: bool,
}

impl TransactionSession {
    /// Starts transaction queue mode for this connection.
    ///
    /// Returns `false` when a transaction is already open.
    #[must_use]
    pub fn begin_multi(&mut self) -> bool {
        if self.in_multi {
            return false;
        }
        self.in_multi = true;
        self.queued_commands.clear();
        self.queue_error = false;
        true
    }

    /// Queues one command for later `EXEC`.
    ///
    /// Returns `false` when the session is not currently in `MULTI` mode.
    #[must_use]
    pub fn queue_command(&mut self, frame: CommandFrame) -> bool {
        if !self.in_multi {
            return false;
        }
        self.queued_commands.push(frame);
        true
    }

    /// Poisons the open batch after a queueing error; `EXEC` will abort.
    pub fn note_queue_error(&mut self) {
        if self.in_multi {
            self.queue_error = true;
        }
    }

    /// Discards queued transaction commands and exits `MULTI` mode.
    ///
    /// Returns `false` when no transaction is active.
    #[must_use]
    pub fn discard(&mut self) -> bool {
        if !self.in_multi {
            return false;
        }
        self.in_multi = false;
        self.queued_commands.clear();
        self.queue_error = false;
        true
    }

    /// Exits `MULTI` mode and returns the batch for execution.
    ///
    /// Returns `None` when no transaction is active.
    pub fn take_queued_for_exec(&mut self) -> Option<ExecOutcome> {
        if !self.in_multi {
            return None;
        }
        self.in_multi = false;
        if std::mem::take(&mut self.queue_error) {
            self.queued_commands.clear();
            return Some(ExecOutcome::Abort);
        }
        Some(ExecOutcome::Run(std::mem::take(&mut self.queued_commands)))
    }

    /// Returns whether this connection is currently in `MULTI` mode.
    #[must_use]
    pub fn in_multi(&self) -> bool {
        self.in_multi
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecOutcome, TransactionSession};
    use darter_core::command::CommandFrame;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn begin_multi_rejects_nested_open() {
        let mut session = TransactionSession::default();
        assert_that!(session.begin_multi(), eq(true));
        assert_that!(session.begin_multi(), eq(false));
    }

    #[rstest]
    fn queue_and_exec_transfers_commands() {
        let mut session = TransactionSession::default();
        let _ = session.begin_multi();
        let _ = session.queue_command(CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()]));

        let outcome = session
            .take_queued_for_exec()
            .expect("session should hold an open batch");
        let ExecOutcome::Run(queued) = outcome else {
            panic!("clean batch must run");
        };
        assert_that!(queued.len(), eq(1_usize));
        assert_that!(session.in_multi(), eq(false));
    }

    #[rstest]
    fn discard_clears_queue_and_state() {
        let mut session = TransactionSession::default();
        let _ = session.begin_multi();
        let _ = session.queue_command(CommandFrame::new("GET", vec![b"k".to_vec()]));

        assert_that!(session.discard(), eq(true));
        assert_that!(session.in_multi(), eq(false));
        assert_that!(session.take_queued_for_exec().is_none(), eq(true));
    }

    #[rstest]
    fn queue_error_turns_exec_into_abort() {
        let mut session = TransactionSession::default();
        let _ = session.begin_multi();
        let _ = session.queue_command(CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()]));
        session.note_queue_error();

        let outcome = session
            .take_queued_for_exec()
            .expect("session should hold an open batch");
        assert_that!(outcome, eq(&ExecOutcome::Abort));

        // The error does not leak into the next batch.
        assert_that!(session.begin_multi(), eq(true));
        let outcome = session
            .take_queued_for_exec()
            .expect("session should hold an open batch");
        assert_that!(outcome, eq(&ExecOutcome::Run(Vec::new())));
    }

    #[rstest]
    fn queue_error_outside_multi_is_ignored() {
        let mut session = TransactionSession::default();
        session.note_queue_error();
        let _ = session.begin_multi();
        let outcome = session
            .take_queued_for_exec()
            .expect("session should hold an open batch");
        assert_that!(outcome, eq(&ExecOutcome::Run(Vec::new())));
    }
}

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandResult {
    NotAttempted,
    Ok,
    RejectedNoCreate,
    RejectedNoDelete,
    RejectedNonFastForward,
    RejectedCurrentBranch,
    RejectedMissingObject,
    RejectedOtherReason,
    LockFailure,
}

impl CommandResult {
    pub fn is_terminal(self) -> bool {
        self != CommandResult::NotAttempted
    }

    pub fn is_rejection(self) -> bool {
        !matches!(self, CommandResult::NotAttempted | CommandResult::Ok)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandResult::NotAttempted => "not attempted",
            CommandResult::Ok => "ok",
            CommandResult::RejectedNoCreate => "creation prohibited",
            CommandResult::RejectedNoDelete => "deletion prohibited",
            CommandResult::RejectedNonFastForward => "non-fast forward",
            CommandResult::RejectedCurrentBranch => "branch is currently checked out",
            CommandResult::RejectedMissingObject => "missing object(s)",
            CommandResult::RejectedOtherReason => "rejected",
            CommandResult::LockFailure => "failed to lock",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub result: CommandResult,
    pub message: Option<String>,
}

/// One ref update requested by the client.
///
/// The status moves out of `NotAttempted` at most once. Whoever gets there
/// first (the commit processor, or the coordinator after a timeout) wins;
/// later writes are refused.
#[derive(Debug)]
pub struct ReceiveCommand {
    ref_name: String,
    old_id: ObjectId,
    new_id: ObjectId,
    status: Mutex<CommandStatus>,
}

impl ReceiveCommand {
    pub fn new(old_id: ObjectId, new_id: ObjectId, ref_name: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            old_id,
            new_id,
            status: Mutex::new(CommandStatus {
                result: CommandResult::NotAttempted,
                message: None,
            }),
        }
    }

    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    pub fn old_id(&self) -> ObjectId {
        self.old_id
    }

    pub fn new_id(&self) -> ObjectId {
        self.new_id
    }

    pub fn command_type(&self) -> CommandType {
        if self.old_id.is_zero() {
            CommandType::Create
        } else if self.new_id.is_zero() {
            CommandType::Delete
        } else {
            CommandType::Update
        }
    }

    pub fn result(&self) -> CommandResult {
        self.status.lock().result
    }

    pub fn message(&self) -> Option<String> {
        self.status.lock().message.clone()
    }

    pub fn status(&self) -> CommandStatus {
        self.status.lock().clone()
    }

    /// Sets the terminal result. Returns `false` without touching the
    /// status if a result was already recorded or `result` is
    /// `NotAttempted`.
    pub fn set_result(&self, result: CommandResult, message: Option<&str>) -> bool {
        if !result.is_terminal() {
            return false;
        }
        let mut status = self.status.lock();
        if status.result.is_terminal() {
            return false;
        }
        status.result = result;
        status.message = message.map(str::to_owned);
        true
    }

    pub fn reject(&self, message: &str) -> bool {
        self.set_result(CommandResult::RejectedOtherReason, Some(message))
    }
}

/// Commands of one push, shared between the protocol thread and the worker.
pub type CommandSet = Arc<[ReceiveCommand]>;

pub fn command_set(commands: Vec<ReceiveCommand>) -> CommandSet {
    commands.into()
}

/// Rejects every command still waiting for a result. Returns how many
/// commands were changed.
pub fn reject_unattempted(commands: &[ReceiveCommand], message: &str) -> usize {
    commands
        .iter()
        .filter(|command| command.result() == CommandResult::NotAttempted)
        .filter(|command| command.reject(message))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test_timeout::timeout]
    fn command_type_follows_zero_ids() {
        let create = ReceiveCommand::new(ObjectId::zero(), id(1), "refs/heads/a");
        let delete = ReceiveCommand::new(id(1), ObjectId::zero(), "refs/heads/a");
        let update = ReceiveCommand::new(id(1), id(2), "refs/heads/a");
        assert_eq!(create.command_type(), CommandType::Create);
        assert_eq!(delete.command_type(), CommandType::Delete);
        assert_eq!(update.command_type(), CommandType::Update);
    }

    #[test_timeout::timeout]
    fn result_is_written_once() {
        let command = ReceiveCommand::new(id(1), id(2), "refs/for/main");
        assert!(command.set_result(CommandResult::RejectedNonFastForward, Some("behind")));
        assert!(!command.set_result(CommandResult::Ok, None));
        assert!(!command.reject("internal error"));
        assert_eq!(command.result(), CommandResult::RejectedNonFastForward);
        assert_eq!(command.message().as_deref(), Some("behind"));
    }

    #[test_timeout::timeout]
    fn not_attempted_is_not_a_valid_write() {
        let command = ReceiveCommand::new(id(1), id(2), "refs/heads/main");
        assert!(!command.set_result(CommandResult::NotAttempted, None));
        assert_eq!(command.result(), CommandResult::NotAttempted);
    }

    #[test_timeout::timeout]
    fn reject_unattempted_leaves_processed_commands_alone() {
        let commands = command_set(vec![
            ReceiveCommand::new(id(1), id(2), "refs/heads/a"),
            ReceiveCommand::new(id(1), id(3), "refs/heads/b"),
            ReceiveCommand::new(id(1), id(4), "refs/heads/c"),
        ]);
        commands[1].set_result(CommandResult::Ok, None);

        assert_eq!(reject_unattempted(&commands, "internal error"), 2);
        assert_eq!(commands[0].result(), CommandResult::RejectedOtherReason);
        assert_eq!(commands[1].result(), CommandResult::Ok);
        assert_eq!(commands[2].message().as_deref(), Some("internal error"));
    }
}

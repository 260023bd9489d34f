use crate::cmd::{cmd, Cmd};
use crate::errors::{Error, Result};
use crate::routing;
use crate::types::Reply;

/// A precondition checked under WATCH before the transaction body runs.
#[derive(Debug, Clone)]
pub enum Condition {
    KeyExists(Vec<u8>),
    KeyNotExists(Vec<u8>),
    KeyEquals(Vec<u8>, Vec<u8>),
}

impl Condition {
    pub(crate) fn key(&self) -> &[u8] {
        match self {
            Condition::KeyExists(key)
            | Condition::KeyNotExists(key)
            | Condition::KeyEquals(key, _) => key,
        }
    }

    /// The read that evaluates this condition once the key is watched.
    pub(crate) fn check_command(&self) -> Cmd {
        match self {
            Condition::KeyExists(key) | Condition::KeyNotExists(key) => {
                cmd("EXISTS").arg_key(key)
            }
            Condition::KeyEquals(key, _) => cmd("GET").arg_key(key),
        }
    }

    pub(crate) fn is_satisfied(&self, reply: &Reply) -> bool {
        match self {
            Condition::KeyExists(_) => reply.as_int() == Some(1),
            Condition::KeyNotExists(_) => reply.as_int() == Some(0),
            Condition::KeyEquals(_, expected) => reply.as_bytes() == Some(expected.as_slice()),
        }
    }
}

/// Builder capturing an ordered command sequence and its preconditions.
/// Execution happens through [`crate::Multiplexer::run_transaction`]: the
/// whole block is issued on one bridge under a single writer-mutex hold, so
/// nothing interleaves between `MULTI` and `EXEC` on the wire.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    commands: Vec<Cmd>,
    conditions: Vec<Condition>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    /// Adds a command to the transaction body.
    pub fn command(&mut self, command: Cmd) -> &mut Transaction {
        self.commands.push(command);
        self
    }

    /// Adds a WATCH precondition.
    pub fn condition(&mut self, condition: Condition) -> &mut Transaction {
        self.conditions.push(condition);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn commands(&self) -> &[Cmd] {
        &self.commands
    }

    pub(crate) fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// The single slot every key in the transaction must map to, or
    /// `CrossSlot` when the body and conditions disagree.
    pub(crate) fn combined_slot(&self) -> Result<Option<u16>> {
        let mut combined: Option<u16> = None;
        let mut fold = |slot: u16| -> Result<()> {
            match combined {
                None => {
                    combined = Some(slot);
                    Ok(())
                }
                Some(existing) if existing != slot => Err(Error::CrossSlot),
                Some(_) => Ok(()),
            }
        };
        for command in &self.commands {
            if command.is_cross_slot() {
                return Err(Error::CrossSlot);
            }
            if let Some(slot) = command.hash_slot() {
                fold(slot)?;
            }
        }
        for condition in &self.conditions {
            fold(routing::hash_slot(condition.key()))?;
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_evaluate_replies() {
        let exists = Condition::KeyExists(b"k".to_vec());
        assert!(exists.is_satisfied(&Reply::Int(1)));
        assert!(!exists.is_satisfied(&Reply::Int(0)));

        let absent = Condition::KeyNotExists(b"k".to_vec());
        assert!(absent.is_satisfied(&Reply::Int(0)));

        let equals = Condition::KeyEquals(b"k".to_vec(), b"v1".to_vec());
        assert!(equals.is_satisfied(&Reply::Bulk(Some(b"v1".to_vec()))));
        assert!(!equals.is_satisfied(&Reply::Bulk(Some(b"v2".to_vec()))));
        assert!(!equals.is_satisfied(&Reply::Bulk(None)));
    }

    #[test]
    fn combined_slot_spans_body_and_conditions() {
        let mut txn = Transaction::new();
        txn.command(cmd("SET").arg_key("{user}.a").arg("1"));
        txn.condition(Condition::KeyExists(b"{user}.b".to_vec()));
        assert_eq!(
            txn.combined_slot().unwrap(),
            Some(routing::hash_slot(b"{user}.a"))
        );

        txn.condition(Condition::KeyExists(b"other".to_vec()));
        assert!(matches!(txn.combined_slot(), Err(Error::CrossSlot)));
    }

    #[test]
    fn unkeyed_transaction_has_no_slot() {
        let mut txn = Transaction::new();
        txn.command(cmd("PING"));
        assert_eq!(txn.combined_slot().unwrap(), None);
    }
}

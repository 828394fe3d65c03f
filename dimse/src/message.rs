//! DIMSE message assembly.
//!
//! The association layer hands over complete command and data set
//! payloads per presentation context;
//! this module pairs them into messages.
//! A command whose Data Set Type says "no data set present"
//! forms a message on its own;
//! otherwise the message is complete
//! once the data set payload for the same context arrives.

use tracing::debug;

use crate::command_set::CommandSet;
use crate::{ContextMismatchSnafu, DataWithoutCommandSnafu, Result};

/// A complete DIMSE message:
/// a command set plus its optional data set payload.
///
/// The data set bytes stay in the transfer syntax
/// negotiated for the presentation context;
/// decoding them is the service handler's call.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    /// the presentation context the message arrived on
    pub context_id: u8,
    /// the command set
    pub command: CommandSet,
    /// the data set payload, when the command announces one
    pub dataset: Option<Vec<u8>>,
}

/// Pairs command sets with their data set payloads,
/// one instance per association.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: Option<DimseMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        MessageAssembler::default()
    }

    /// Feed a complete command payload.
    ///
    /// Returns a message right away when the command
    /// carries no data set; otherwise the command is held
    /// until [`push_data`](Self::push_data) completes it.
    pub fn push_command(&mut self, context_id: u8, data: &[u8]) -> Result<Option<DimseMessage>> {
        let command = CommandSet::decode(data)?;
        debug!(
            "received {} on context {}",
            command.command_field, context_id
        );

        if let Some(dropped) = self.pending.take() {
            // a new command supersedes an unfinished message
            debug!(
                "dropping incomplete {} while awaiting its data set",
                dropped.command.command_field
            );
        }

        if command.has_data_set() {
            self.pending = Some(DimseMessage {
                context_id,
                command,
                dataset: None,
            });
            Ok(None)
        } else {
            Ok(Some(DimseMessage {
                context_id,
                command,
                dataset: None,
            }))
        }
    }

    /// Feed a complete data set payload,
    /// completing the pending command on the same context.
    pub fn push_data(&mut self, context_id: u8, data: Vec<u8>) -> Result<Option<DimseMessage>> {
        match self.pending.take() {
            None => DataWithoutCommandSnafu { context_id }.fail(),
            Some(mut message) => {
                if message.context_id != context_id {
                    let expected = message.context_id;
                    self.pending = Some(message);
                    return ContextMismatchSnafu {
                        expected,
                        got: context_id,
                    }
                    .fail();
                }
                message.dataset = Some(data);
                Ok(Some(message))
            }
        }
    }

    /// Whether a command is waiting for its data set.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any pending command, e.g. on abort.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandField, Priority};

    #[test]
    fn command_without_data_set_completes_immediately() {
        let mut assembler = MessageAssembler::new();
        let echo = CommandSet::echo_rq(1, "1.2.840.10008.1.1");

        let message = assembler
            .push_command(3, &echo.encode())
            .unwrap()
            .expect("echo should complete without a data set");
        assert_eq!(message.context_id, 3);
        assert_eq!(message.command.command_field, CommandField::CEchoRq);
        assert!(message.dataset.is_none());
        assert!(!assembler.has_pending());
    }

    #[test]
    fn command_with_data_set_waits_for_it() {
        let mut assembler = MessageAssembler::new();
        let store = CommandSet::store_rq(2, "1.2.840.10008.5.1.4.1.1.2", "1.2.3", Priority::Medium);

        assert!(assembler.push_command(1, &store.encode()).unwrap().is_none());
        assert!(assembler.has_pending());

        let message = assembler
            .push_data(1, vec![1, 2, 3, 4])
            .unwrap()
            .expect("data set should complete the message");
        assert_eq!(message.command.command_field, CommandField::CStoreRq);
        assert_eq!(message.dataset.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert!(!assembler.has_pending());
    }

    #[test]
    fn data_without_command_is_an_error() {
        let mut assembler = MessageAssembler::new();
        let err = assembler.push_data(1, vec![0]).unwrap_err();
        assert!(matches!(err, crate::Error::DataWithoutCommand { .. }));
    }

    #[test]
    fn context_mismatch_is_an_error() {
        let mut assembler = MessageAssembler::new();
        let store = CommandSet::store_rq(2, "1.2.840.10008.5.1.4.1.1.2", "1.2.3", Priority::Medium);
        assembler.push_command(1, &store.encode()).unwrap();

        let err = assembler.push_data(3, vec![0]).unwrap_err();
        assert!(matches!(err, crate::Error::ContextMismatch { .. }));
        // the pending command survives the stray fragment
        assert!(assembler.has_pending());
    }
}

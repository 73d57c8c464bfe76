//! Inbound command invocations and their acknowledgments

use crate::config::CommandConfig;
use crate::transport::{CommandInvocation, OutboundMessage};
use crate::{RealtalkError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info, warn};

const DEFAULT_ACK: &str = "ok";

/// Receives the string payload of each command invocation
pub trait CommandHandler: Send + Sync {
    fn handle(&self, argument: &str) -> Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    fn handle(&self, argument: &str) -> Result<()> {
        self(argument)
    }
}

/// Run the handler for `invocation` and build its acknowledgment.
///
/// The handler only sees invocations of the configured command that carry
/// the configured argument. Handler failures and panics are logged and
/// never affect the acknowledgment. Returns `None` when the invocation has
/// no id to acknowledge.
pub fn dispatch(
    handler: Option<&dyn CommandHandler>,
    config: Option<&CommandConfig>,
    invocation: &CommandInvocation,
) -> Option<OutboundMessage> {
    match config {
        Some(command) if invocation.name.as_deref() == Some(command.name.as_str()) => {
            let argument = invocation.args.get(&command.argument).and_then(|v| v.as_str());
            match (argument, handler) {
                (Some(argument), Some(handler)) => {
                    info!("Command {}: {:?}", command.name, argument);
                    if let Err(e) = invoke(handler, argument) {
                        warn!("Command {} failed: {}", command.name, e);
                    }
                }
                (Some(_), None) => debug!("No handler for command {}", command.name),
                (None, _) => warn!(
                    "Command {} is missing its {:?} argument",
                    command.name, command.argument
                ),
            }
        }
        _ => debug!("Ignoring unknown command {:?}", invocation.name),
    }

    let Some(id) = invocation.id.clone() else {
        warn!("Command invocation without id cannot be acknowledged");
        return None;
    };

    let name = invocation
        .name
        .clone()
        .or_else(|| config.map(|c| c.name.clone()))
        .unwrap_or_default();
    let result = config
        .map(|c| c.ack_result.clone())
        .unwrap_or_else(|| DEFAULT_ACK.to_string());

    Some(OutboundMessage::CommandAck { id, name, result })
}

fn invoke(handler: &dyn CommandHandler, argument: &str) -> Result<()> {
    catch_unwind(AssertUnwindSafe(|| handler.handle(argument)))
        .unwrap_or_else(|_| Err(RealtalkError::CommandError("handler panicked".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn invocation(id: Option<&str>, name: &str, args: serde_json::Value) -> CommandInvocation {
        CommandInvocation {
            id: id.map(str::to_owned),
            name: Some(name.to_string()),
            args,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl CommandHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |arg: &str| -> Result<()> {
            sink.lock().push(arg.to_string());
            Ok(())
        })
    }

    #[test]
    fn test_invokes_handler_and_acks() {
        let (seen, handler) = recorder();
        let config = CommandConfig::default();
        let ack = dispatch(
            Some(&handler),
            Some(&config),
            &invocation(Some("c1"), "generate_system", json!({"description": "binary star"})),
        );

        assert_eq!(*seen.lock(), vec!["binary star".to_string()]);
        assert_eq!(
            ack,
            Some(OutboundMessage::CommandAck {
                id: "c1".into(),
                name: "generate_system".into(),
                result: "ok".into(),
            })
        );
    }

    #[test]
    fn test_failing_handler_still_acks() {
        let handler = |_: &str| -> Result<()> { Err(RealtalkError::CommandError("busy".into())) };
        let config = CommandConfig::default();
        let ack = dispatch(
            Some(&handler),
            Some(&config),
            &invocation(Some("c2"), "generate_system", json!({"description": "x"})),
        );
        assert!(matches!(ack, Some(OutboundMessage::CommandAck { ref id, .. }) if id == "c2"));
    }

    #[test]
    fn test_panicking_handler_still_acks() {
        let handler = |_: &str| -> Result<()> { panic!("boom") };
        let config = CommandConfig::default();
        let ack = dispatch(
            Some(&handler),
            Some(&config),
            &invocation(Some("c3"), "generate_system", json!({"description": "x"})),
        );
        assert!(ack.is_some());
    }

    #[test]
    fn test_missing_argument_skips_handler() {
        let (seen, handler) = recorder();
        let config = CommandConfig::default();
        let ack = dispatch(
            Some(&handler),
            Some(&config),
            &invocation(Some("c4"), "generate_system", json!({"other": 1})),
        );
        assert!(seen.lock().is_empty());
        assert!(ack.is_some());
    }

    #[test]
    fn test_unknown_command_acked_with_default_result() {
        let (seen, handler) = recorder();
        let ack = dispatch(
            Some(&handler),
            None,
            &invocation(Some("c5"), "something_else", json!({"description": "x"})),
        );
        assert!(seen.lock().is_empty());
        assert_eq!(
            ack,
            Some(OutboundMessage::CommandAck {
                id: "c5".into(),
                name: "something_else".into(),
                result: "ok".into(),
            })
        );
    }

    #[test]
    fn test_missing_id_is_not_acked() {
        let (seen, handler) = recorder();
        let config = CommandConfig::default();
        let ack = dispatch(
            Some(&handler),
            Some(&config),
            &invocation(None, "generate_system", json!({"description": "x"})),
        );
        assert_eq!(seen.lock().len(), 1);
        assert!(ack.is_none());
    }
}

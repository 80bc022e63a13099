//! 错误恢复引擎
//!
//! 根据 HandleError 类型返回 RecoveryAction：执行失败让智能体带着失败原因重试，决策失败则结束本轮。

use crate::actuator::ActuatorError;
use crate::core::{HandleError, RecoveryAction};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &HandleError) -> RecoveryAction {
        match err {
            HandleError::Actuation(ActuatorError::Rejected(function)) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Action `{function}` was rejected by the application. Choose a different control or function."
                ))
            }
            HandleError::Actuation(ActuatorError::WindowUnavailable(title)) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Window `{title}` is no longer available. Re-select an application if needed."
                ))
            }
            HandleError::Actuation(ActuatorError::Failed(msg)) => {
                RecoveryAction::RetryWithPrompt(format!("Action failed: {msg}"))
            }
            HandleError::ApplicationNotFound(target) => RecoveryAction::RetryWithPrompt(format!(
                "Application `{target}` is not among the available windows. Pick one from the list."
            )),
            HandleError::Decision(e) => RecoveryAction::Abort(e.to_string()),
            HandleError::Context(e) => RecoveryAction::Abort(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{ContextKey, ValueKind};
    use crate::core::ContextError;
    use crate::llm::PromptError;

    #[test]
    fn test_recovery_rejected_action_retries() {
        let engine = RecoveryEngine::new();
        let err = HandleError::Actuation(ActuatorError::Rejected("click_input".into()));
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("click_input")),
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_unknown_application_retries() {
        let engine = RecoveryEngine::new();
        let err = HandleError::ApplicationNotFound("Paint".into());
        assert!(matches!(
            engine.handle(&err),
            RecoveryAction::RetryWithPrompt(_)
        ));
    }

    #[test]
    fn test_recovery_decision_error_aborts() {
        let engine = RecoveryEngine::new();
        let err = HandleError::Decision(PromptError::MissingStatus);
        assert!(matches!(engine.handle(&err), RecoveryAction::Abort(_)));
    }

    #[test]
    fn test_recovery_context_error_aborts() {
        let engine = RecoveryEngine::new();
        let err = HandleError::Context(ContextError::TypeMismatch {
            key: ContextKey::SessionStep,
            expected: ValueKind::Int,
            actual: ValueKind::Text,
        });
        assert!(matches!(engine.handle(&err), RecoveryAction::Abort(_)));
    }
}

//! Applies decided actions against the destination, one call at a time.

use e2s_core::AddressId;
use serde::Serialize;

use crate::api::AddressApi;
use crate::error::ApiError;
use crate::reconcile::{Action, Operation};
use crate::retry::{Retrier, Sleeper};

/// What happened when one action was applied. `I` is the id type a create
/// call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome<I = AddressId> {
    /// The action needs no destination call.
    NoCall,
    Applied {
        #[serde(skip_serializing_if = "Option::is_none")]
        created: Option<I>,
        attempts: u32,
    },
    Failed { error: ApiError, attempts: u32 },
}

impl<I> ExecutionOutcome<I> {
    pub fn is_success(&self) -> bool {
        !matches!(self, ExecutionOutcome::Failed { .. })
    }

    /// Turns a retried call into an outcome, logging it under `what`.
    pub(crate) fn from_call(what: &str, result: Result<Option<I>, ApiError>, attempts: u32) -> Self
    where
        I: std::fmt::Display,
    {
        match result {
            Ok(created) => {
                match &created {
                    Some(id) => tracing::info!("{what}: created {id}"),
                    None => tracing::info!("{what}: done"),
                }
                ExecutionOutcome::Applied { created, attempts }
            }
            Err(error) => ExecutionOutcome::Failed { error, attempts },
        }
    }
}

impl ExecutionOutcome {
    /// Destination id the action's state change applies to.
    pub fn target<'a>(&'a self, action: &'a Action) -> Option<&'a AddressId> {
        match self {
            ExecutionOutcome::Applied {
                created: Some(id), ..
            } => Some(id),
            ExecutionOutcome::Failed { .. } => None,
            _ => action.destination_id.as_ref(),
        }
    }
}

/// Applies every action in order. A failure is recorded and the next
/// action proceeds.
pub fn execute<A: AddressApi, S: Sleeper>(
    api: &mut A,
    retrier: &mut Retrier<S>,
    actions: &[Action],
) -> Vec<ExecutionOutcome> {
    actions
        .iter()
        .map(|action| execute_one(api, retrier, action))
        .collect()
}

fn execute_one<A: AddressApi, S: Sleeper>(
    api: &mut A,
    retrier: &mut Retrier<S>,
    action: &Action,
) -> ExecutionOutcome {
    let Some(operation) = &action.operation else {
        return ExecutionOutcome::NoCall;
    };
    let what = format!(
        "{} {}",
        action.kind,
        action
            .destination_id
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| action.source_id.as_ref().map(ToString::to_string))
            .unwrap_or_default()
    );

    let (result, attempts) = match (operation, &action.destination_id) {
        (Operation::Create { payload }, _) => {
            let out = retrier.call(&what, || api.create_address(payload));
            (out.result.map(Some), out.attempts)
        }
        (Operation::Patch { patch }, Some(id)) => {
            let out = retrier.call(&what, || api.patch_address(id, patch));
            (out.result.map(|()| None), out.attempts)
        }
        (Operation::Delete, Some(id)) => {
            let out = retrier.call(&what, || api.delete_address(id));
            (out.result.map(|()| None), out.attempts)
        }
        (_, None) => {
            return ExecutionOutcome::Failed {
                error: ApiError::Transport(format!("{what}: no destination id")),
                attempts: 0,
            }
        }
    };

    ExecutionOutcome::from_call(&what, result, attempts)
}

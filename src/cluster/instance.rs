//! Cluster instance lifecycle state machine.
//!
//! ```text
//!   Pending ──► Creating ──► Ready ◄──► Busy ──► Idle
//!                  │           │                  │ ▲
//!                  ▼           │                  │ │ reuse
//!                Failed        │                  ▼ │
//!                              └──────────► Destroying ──► Destroyed
//! ```
//!
//! `Idle ──► Busy` is the reuse edge. `Failed` and `Destroyed` are terminal.

use std::fmt;

use tokio::time::Instant;

use super::pool::PoolError;
use crate::provider::InstanceContext;

/// Lifecycle state of a [`ClusterInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Creating,
    Ready,
    Busy,
    Idle,
    Destroying,
    Destroyed,
    Failed,
}

impl InstanceState {
    /// Returns `true` if `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;

        matches!(
            (self, next),
            (Pending, Creating)
                | (Creating, Ready)
                | (Creating, Failed)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Busy, Idle)
                | (Idle, Busy)
                | (Ready, Destroying)
                | (Idle, Destroying)
                | (Destroying, Destroyed)
        )
    }

    /// Instances in these states can be handed to a task without creation.
    pub fn is_reusable(self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Idle)
    }

    /// Instances in these states count against the provider's cap.
    pub fn is_live(self) -> bool {
        !matches!(self, InstanceState::Destroyed | InstanceState::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One concrete, lazily created cluster owned by a provider's pool.
#[derive(Debug, Clone)]
pub struct ClusterInstance {
    /// `<provider>-<ordinal>`, ordinals start at 1 and are never reused.
    pub id: String,
    pub provider: String,
    pub state: InstanceState,
    pub created_at: Option<Instant>,
    pub last_used_at: Option<Instant>,
    /// Creation attempts beyond the first.
    pub retries_used: usize,
    pub bound_task_ids: Vec<usize>,
    /// Connection info reported by the driver once ready.
    pub connection: Option<String>,
    /// Resolved creation context, kept for teardown.
    pub context: Option<InstanceContext>,
}

impl ClusterInstance {
    pub fn new(provider: &str, ordinal: usize) -> Self {
        Self {
            id: format!("{provider}-{ordinal}"),
            provider: provider.to_string(),
            state: InstanceState::Pending,
            created_at: None,
            last_used_at: None,
            retries_used: 0,
            bound_task_ids: Vec::new(),
            connection: None,
            context: None,
        }
    }

    /// Moves the instance to `next`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidTransition` for edges outside the state
    /// machine; the state is left untouched.
    pub fn transition(&mut self, next: InstanceState) -> Result<(), PoolError> {
        if !self.state.can_transition_to(next) {
            return Err(PoolError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }

        match next {
            InstanceState::Ready if self.state == InstanceState::Creating => {
                self.created_at = Some(Instant::now());
            }
            InstanceState::Idle | InstanceState::Ready => {
                self.last_used_at = Some(Instant::now());
                self.bound_task_ids.clear();
            }
            _ => {}
        }

        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    #[test]
    fn test_instance_id_format() {
        let instance = ClusterInstance::new("a_provider", 2);
        assert_eq!(instance.id, "a_provider-2");
        assert_eq!(instance.state, Pending);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut instance = ClusterInstance::new("p", 1);
        for next in [Creating, Ready, Busy, Idle, Busy, Idle, Destroying, Destroyed] {
            instance.transition(next).unwrap();
        }
        assert_eq!(instance.state, Destroyed);
        assert!(instance.created_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut instance = ClusterInstance::new("p", 1);
        assert!(instance.transition(Busy).is_err());

        instance.transition(Creating).unwrap();
        instance.transition(Failed).unwrap();
        let err = instance.transition(Ready).unwrap_err();
        assert_eq!(err.to_string(), "illegal transition of p-1 from Failed to Ready");
        assert_eq!(instance.state, Failed);
    }

    #[test]
    fn test_busy_cannot_be_destroyed() {
        assert!(!Busy.can_transition_to(Destroying));
        assert!(Idle.can_transition_to(Destroying));
        assert!(Ready.can_transition_to(Destroying));
    }

    #[test]
    fn test_release_clears_bindings() {
        let mut instance = ClusterInstance::new("p", 1);
        instance.transition(Creating).unwrap();
        instance.transition(Ready).unwrap();
        instance.transition(Busy).unwrap();
        instance.bound_task_ids.push(7);

        instance.transition(Idle).unwrap();

        assert!(instance.bound_task_ids.is_empty());
        assert!(instance.last_used_at.is_some());
    }
}

//! Run statuses and task completion aggregation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status reported by every public run operation and by task callbacks.
///
/// All engine failure is representable with this enum plus diagnostic logging;
/// `Start`, `Tick` and `Stop` never return errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Stopped,
    Succeeded,
    Failed,
    #[default]
    Unset,
}

impl RunStatus {
    pub fn is_running(self) -> bool {
        self == RunStatus::Running
    }

    /// Succeeded, Failed or Stopped.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Stopped
        )
    }

    /// Merge priority: Failed > Succeeded > Stopped > Running > Unset.
    pub fn priority(self) -> u8 {
        match self {
            RunStatus::Unset => 0,
            RunStatus::Running => 1,
            RunStatus::Stopped => 2,
            RunStatus::Succeeded => 3,
            RunStatus::Failed => 4,
        }
    }

    /// Returns the higher-priority status of the two.
    pub fn merge(self, other: RunStatus) -> RunStatus {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "Running",
            RunStatus::Stopped => "Stopped",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Unset => "Unset",
        };
        f.write_str(s)
    }
}

/// Per-task status packed into two bits. The numeric order is the merge priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskStatus {
    Running = 0,
    Stopped = 1,
    Succeeded = 2,
    Failed = 3,
}

impl TaskStatus {
    fn from_bits(bits: u64) -> TaskStatus {
        match bits & 0b11 {
            0 => TaskStatus::Running,
            1 => TaskStatus::Stopped,
            2 => TaskStatus::Succeeded,
            _ => TaskStatus::Failed,
        }
    }

    pub fn to_run_status(self) -> RunStatus {
        match self {
            TaskStatus::Running => RunStatus::Running,
            TaskStatus::Stopped => RunStatus::Stopped,
            TaskStatus::Succeeded => RunStatus::Succeeded,
            TaskStatus::Failed => RunStatus::Failed,
        }
    }
}

impl From<RunStatus> for TaskStatus {
    /// `Unset` maps to `Running`: a task that did not report anything is still running.
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Stopped => TaskStatus::Stopped,
            RunStatus::Succeeded => TaskStatus::Succeeded,
            RunStatus::Failed => TaskStatus::Failed,
            RunStatus::Running | RunStatus::Unset => TaskStatus::Running,
        }
    }
}

/// How the statuses of several tasks combine into one state status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompletionPolicy {
    /// Complete once every counted task is done.
    All,
    /// Complete as soon as one counted task is done.
    #[default]
    Any,
}

/// Maximum number of tasks a single state (or the global task list) may hold.
pub const MAX_TASKS_PER_GROUP: usize = 32;

/// Packed completion bitfield of one task group (a state's tasks or the global tasks).
///
/// Two bits per task; `counted` marks tasks that participate in completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TasksCompletion {
    bits: u64,
    counted: u32,
    task_count: u8,
    policy: CompletionPolicy,
}

impl TasksCompletion {
    pub fn new(task_count: usize, counted: u32, policy: CompletionPolicy) -> Self {
        debug_assert!(task_count <= MAX_TASKS_PER_GROUP);
        TasksCompletion {
            bits: 0,
            counted,
            task_count: task_count.min(MAX_TASKS_PER_GROUP) as u8,
            policy,
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_count as usize
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    pub fn is_counted(&self, task: usize) -> bool {
        task < MAX_TASKS_PER_GROUP && self.counted & (1 << task) != 0
    }

    pub fn get(&self, task: usize) -> TaskStatus {
        if task >= self.task_count() {
            return TaskStatus::Running;
        }
        TaskStatus::from_bits(self.bits >> (task * 2))
    }

    /// Overwrites the status of one task.
    pub fn set(&mut self, task: usize, status: TaskStatus) {
        if task >= self.task_count() {
            return;
        }
        let shift = task * 2;
        self.bits = (self.bits & !(0b11 << shift)) | ((status as u64) << shift);
    }

    /// Sets the status only if it has a higher merge priority than the current one.
    pub fn set_with_priority(&mut self, task: usize, status: TaskStatus) {
        if status > self.get(task) {
            self.set(task, status);
        }
    }

    /// Marks every task as running again.
    pub fn reset(&mut self) {
        self.bits = 0;
    }

    /// Aggregated status of the group under its completion policy.
    ///
    /// A counted failure always fails the group. A group without counted tasks
    /// never completes on its own.
    pub fn status(&self) -> RunStatus {
        let mut merged: Option<TaskStatus> = None;
        let mut any_running = false;
        for task in 0..self.task_count() {
            if !self.is_counted(task) {
                continue;
            }
            let status = self.get(task);
            if status == TaskStatus::Failed {
                return RunStatus::Failed;
            }
            if status == TaskStatus::Running {
                any_running = true;
            } else {
                merged = Some(merged.map_or(status, |m| m.max(status)));
            }
        }
        match (self.policy, merged) {
            (_, None) => RunStatus::Running,
            (CompletionPolicy::All, Some(_)) if any_running => RunStatus::Running,
            (_, Some(status)) => status.to_run_status(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_merge_priority() {
        assert_eq!(RunStatus::Running.merge(RunStatus::Stopped), RunStatus::Stopped);
        assert_eq!(RunStatus::Succeeded.merge(RunStatus::Stopped), RunStatus::Succeeded);
        assert_eq!(RunStatus::Succeeded.merge(RunStatus::Failed), RunStatus::Failed);
        assert_eq!(RunStatus::Unset.merge(RunStatus::Running), RunStatus::Running);
    }

    #[test]
    fn test_all_policy_waits_for_every_counted_task() {
        let mut group = TasksCompletion::new(3, 0b111, CompletionPolicy::All);
        group.set(0, TaskStatus::Succeeded);
        assert_eq!(group.status(), RunStatus::Running);
        group.set(2, TaskStatus::Stopped);
        assert_eq!(group.status(), RunStatus::Running);
        group.set(1, TaskStatus::Succeeded);
        assert_eq!(group.status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_failure_short_circuits_all_policy() {
        let mut group = TasksCompletion::new(3, 0b111, CompletionPolicy::All);
        group.set(1, TaskStatus::Failed);
        assert_eq!(group.status(), RunStatus::Failed);
    }

    #[test]
    fn test_any_policy_completes_on_first() {
        let mut group = TasksCompletion::new(2, 0b11, CompletionPolicy::Any);
        assert_eq!(group.status(), RunStatus::Running);
        group.set(1, TaskStatus::Stopped);
        assert_eq!(group.status(), RunStatus::Stopped);
    }

    #[test]
    fn test_uncounted_tasks_do_not_block_or_complete() {
        let mut group = TasksCompletion::new(2, 0b01, CompletionPolicy::All);
        group.set(1, TaskStatus::Failed);
        assert_eq!(group.status(), RunStatus::Running);
        group.set(0, TaskStatus::Succeeded);
        assert_eq!(group.status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_set_with_priority_never_downgrades() {
        let mut group = TasksCompletion::new(1, 0b1, CompletionPolicy::Any);
        group.set_with_priority(0, TaskStatus::Failed);
        group.set_with_priority(0, TaskStatus::Succeeded);
        assert_eq!(group.get(0), TaskStatus::Failed);
        group.reset();
        assert_eq!(group.get(0), TaskStatus::Running);
    }
}

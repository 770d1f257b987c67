//! Turn budgets: how many agent turns a task may use.

use crate::agent::collaborators::{Task, TaskType};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TurnBudgetConfig {
    pub epic: u32,
    pub story: u32,
    pub task: u32,
    pub subtask: u32,
    /// Growth applied when a retry needs more turns.
    pub retry_multiplier: f64,
    /// No budget ever exceeds this.
    pub absolute_max: u32,
    pub max_extensions: u32,
}

impl Default for TurnBudgetConfig {
    fn default() -> Self {
        Self {
            epic: 30,
            story: 20,
            task: 10,
            subtask: 5,
            retry_multiplier: 1.5,
            absolute_max: 50,
            max_extensions: 2,
        }
    }
}

impl TurnBudgetConfig {
    pub fn base_for(&self, task_type: TaskType) -> u32 {
        match task_type {
            TaskType::Epic => self.epic,
            TaskType::Story => self.story,
            TaskType::Task => self.task,
            TaskType::Subtask => self.subtask,
        }
    }
}

/// Turn limit for one task run.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnBudget {
    pub initial_max: u32,
    pub current_max: u32,
    pub absolute_max: u32,
    retry_multiplier: f64,
    extensions_left: u32,
}

impl TurnBudget {
    pub fn new(initial_max: u32, absolute_max: u32, retry_multiplier: f64, max_extensions: u32) -> Self {
        let absolute_max = absolute_max.max(1);
        let initial_max = initial_max.clamp(1, absolute_max);
        Self {
            initial_max,
            current_max: initial_max,
            absolute_max,
            retry_multiplier,
            extensions_left: max_extensions,
        }
    }

    /// Budget for `task`. An explicit `max_turns` is a hard limit; otherwise
    /// the per-type base is scaled by the `complexity` metadata.
    pub fn for_task(task: &Task, config: &TurnBudgetConfig) -> Self {
        if let Some(limit) = task.max_turns {
            return Self::new(limit, limit, 1.0, 0);
        }
        let scale = match task.metadata.get("complexity").map(|s| s.to_lowercase()) {
            Some(ref c) if c == "low" => 0.5,
            Some(ref c) if c == "high" => 1.5,
            _ => 1.0,
        };
        let base = (config.base_for(task.task_type) as f64 * scale).ceil() as u32;
        Self::new(
            base,
            config.absolute_max,
            config.retry_multiplier,
            config.max_extensions,
        )
    }

    /// Grow the budget after a retry. Returns the new limit if granted.
    pub fn request_extension(&mut self) -> Option<u32> {
        if self.extensions_left == 0 {
            return None;
        }
        let grown = (self.current_max as f64 * self.retry_multiplier).ceil() as u32;
        let new_max = grown.min(self.absolute_max);
        if new_max > self.current_max {
            self.extensions_left -= 1;
            self.current_max = new_max;
            Some(new_max)
        } else {
            None
        }
    }

    /// Whether `turn` (1-based) may run.
    pub fn allows(&self, turn: u32) -> bool {
        turn <= self.current_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bases() {
        let config = TurnBudgetConfig::default();
        let budget = |t| TurnBudget::for_task(&Task::new("x", "x", t), &config).current_max;
        assert_eq!(budget(TaskType::Epic), 30);
        assert_eq!(budget(TaskType::Story), 20);
        assert_eq!(budget(TaskType::Task), 10);
        assert_eq!(budget(TaskType::Subtask), 5);
    }

    #[test]
    fn explicit_limit_is_hard() {
        let task = Task::new("x", "x", TaskType::Epic).with_max_turns(10);
        let mut budget = TurnBudget::for_task(&task, &TurnBudgetConfig::default());
        assert_eq!(budget.current_max, 10);
        assert!(budget.allows(10));
        assert!(!budget.allows(11));
        assert!(budget.request_extension().is_none());
    }

    #[test]
    fn complexity_scales_base() {
        let config = TurnBudgetConfig::default();
        let task = Task::new("x", "x", TaskType::Task).with_metadata("complexity", "High");
        assert_eq!(TurnBudget::for_task(&task, &config).current_max, 15);
        let task = Task::new("x", "x", TaskType::Subtask).with_metadata("complexity", "low");
        assert_eq!(TurnBudget::for_task(&task, &config).current_max, 3);
    }

    #[test]
    fn extensions_are_bounded() {
        let mut budget = TurnBudget::new(20, 40, 1.5, 2);
        assert_eq!(budget.request_extension(), Some(30));
        assert_eq!(budget.request_extension(), Some(40));
        assert_eq!(budget.request_extension(), None);
        assert_eq!(budget.current_max, 40);
    }

    #[test]
    fn extension_stops_at_cap() {
        let mut budget = TurnBudget::new(10, 10, 1.5, 5);
        assert!(budget.request_extension().is_none());
    }
}

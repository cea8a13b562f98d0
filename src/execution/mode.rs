use serde::{Deserialize, Serialize};

/// How decisions become orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every non-flat decision is submitted
    #[default]
    Automatic,
    /// Decisions are announced for an operator to act on
    SemiAutomatic,
    /// Submit above the confidence threshold, announce otherwise
    Hybrid,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeAction {
    Submit,
    NotifyOnly,
}

impl ExecutionMode {
    pub fn action(&self, confidence: f64, hybrid_threshold: f64) -> ModeAction {
        match self {
            ExecutionMode::Automatic => ModeAction::Submit,
            ExecutionMode::Hybrid if confidence > hybrid_threshold => ModeAction::Submit,
            ExecutionMode::Hybrid | ExecutionMode::SemiAutomatic | ExecutionMode::Manual => {
                ModeAction::NotifyOnly
            }
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ExecutionMode::Automatic => "automatic",
            ExecutionMode::SemiAutomatic => "semi_automatic",
            ExecutionMode::Hybrid => "hybrid",
            ExecutionMode::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

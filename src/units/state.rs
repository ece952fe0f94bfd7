//! Unit lifecycle state machine.

/// Lifecycle state of a unit.
///
/// Legal transitions:
/// Discovered → Loading → {Loaded, Failed};
/// Loaded → Enabling → {Enabled, Failed};
/// Enabled → Disabling → Disabled;
/// {Loaded, Disabled} → Unloading → Unloaded;
/// Disabled → Enabling → Enabled.
/// Failed is terminal until the unit is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    /// Discovered on disk but not yet loaded.
    Discovered,
    /// Currently being loaded.
    Loading,
    /// Loaded but not yet enabled.
    Loaded,
    /// Currently being enabled.
    Enabling,
    /// Fully enabled and active.
    Enabled,
    /// Currently being disabled.
    Disabling,
    /// Disabled but still in memory.
    Disabled,
    /// Currently being unloaded.
    Unloading,
    /// Completely unloaded.
    Unloaded,
    /// Failed to load or enable.
    Failed,
}

impl UnitState {
    /// Whether the unit is in its active, usable state.
    pub fn is_active(&self) -> bool {
        matches!(self, UnitState::Enabled)
    }

    /// Whether the unit is mid-transition.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            UnitState::Loading | UnitState::Enabling | UnitState::Disabling | UnitState::Unloading
        )
    }

    /// Whether `enable` is legal from this state.
    pub fn can_enable(&self) -> bool {
        matches!(self, UnitState::Loaded | UnitState::Disabled)
    }

    /// Whether `disable` is legal from this state.
    pub fn can_disable(&self) -> bool {
        matches!(self, UnitState::Enabled)
    }
}

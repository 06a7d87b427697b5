//! Merge mode latch and output provenance

/// Whether the external cell has ever supplied a value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MergeMode {
    /// External cell has never held a value
    #[default]
    Passive,
    /// External cell has held a value at least once. Terminal.
    Active,
}

impl MergeMode {
    #[inline]
    pub fn from_flag(controlled: bool) -> Self {
        if controlled {
            MergeMode::Active
        } else {
            MergeMode::Passive
        }
    }

    #[inline]
    pub fn is_active(self) -> bool {
        self == MergeMode::Active
    }

    /// Next mode after observing the external cell
    #[inline]
    pub fn observe(self, external_is_set: bool) -> Self {
        if external_is_set {
            MergeMode::Active
        } else {
            self
        }
    }
}

/// Which rule produced the merged output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeSource {
    /// External cell holds a value
    External,
    /// External cell was cleared after having been active; output is unset
    Cleared,
    /// External cell never engaged; output is the internal value
    Internal,
}

impl MergeSource {
    pub fn classify(external_is_set: bool, mode: MergeMode) -> Self {
        match (external_is_set, mode) {
            (true, _) => MergeSource::External,
            (false, MergeMode::Active) => MergeSource::Cleared,
            (false, MergeMode::Passive) => MergeSource::Internal,
        }
    }
}

/// Whether merging information into an abstract cache state modified it.
///
/// The fixpoint engine stops iterating a loop once widening the state of its header leaves that
/// state unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeResult {
    Unchanged,
    Changed,
}

impl ChangeResult {
    #[inline]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Changed)
    }
}

impl From<bool> for ChangeResult {
    #[inline]
    fn from(changed: bool) -> Self {
        if changed { Self::Changed } else { Self::Unchanged }
    }
}

//! Exchange lifecycle flags.

/// One lifecycle fact about an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Flag {
    RequestChannelObtained = 1 << 0,
    ResponseChannelObtained = 1 << 1,
    ResponseStarted = 1 << 2,
    RequestTerminated = 1 << 3,
    ResponseTerminated = 1 << 4,
    Persistent = 1 << 5,
    Upgraded = 1 << 6,
    /// Handed to another executor and not yet picked up.
    InTransit = 1 << 7,
    /// The handler chain has finished with the exchange.
    Ended = 1 << 8,
    /// The connection will be closed once this exchange is done.
    Abrupt = 1 << 9,
    ErrorHandled = 1 << 10,
    ContinueSent = 1 << 11,
    /// Completion listeners have run.
    Completed = 1 << 12,
}

impl Flag {
    /// Only these may be cleared again; every other flag is monotonic.
    fn is_revocable(self) -> bool {
        matches!(self, Flag::InTransit | Flag::Persistent)
    }
}

/// Set of [`Flag`]s.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    pub fn contains(&self, flag: Flag) -> bool {
        self.0 & flag as u16 != 0
    }

    /// Set `flag`. Returns `false` when it was already set.
    pub(crate) fn insert(&mut self, flag: Flag) -> bool {
        let was_set = self.contains(flag);
        self.0 |= flag as u16;
        !was_set
    }

    pub(crate) fn remove(&mut self, flag: Flag) {
        debug_assert!(flag.is_revocable(), "{flag:?} is monotonic");
        if flag.is_revocable() {
            self.0 &= !(flag as u16);
        }
    }
}

/// Coarse position of an exchange in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A handler may act on it.
    Active,
    /// Moving between executors.
    InTransit,
    /// Handlers are done; body drain and response termination are in progress.
    Completing,
    /// Listeners have run.
    Complete,
    /// The connection left HTTP.
    Upgraded,
}

impl Phase {
    pub(crate) fn of(flags: &Flags) -> Self {
        if flags.contains(Flag::Upgraded) {
            Phase::Upgraded
        } else if flags.contains(Flag::Completed) {
            Phase::Complete
        } else if flags.contains(Flag::InTransit) {
            Phase::InTransit
        } else if flags.contains(Flag::Ended) {
            Phase::Completing
        } else {
            Phase::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_first_set_only() {
        let mut flags = Flags::default();
        assert!(flags.insert(Flag::ResponseStarted));
        assert!(!flags.insert(Flag::ResponseStarted));
        assert!(flags.contains(Flag::ResponseStarted));
        assert!(!flags.contains(Flag::ResponseTerminated));
    }

    #[test]
    fn revocable_flags_clear() {
        let mut flags = Flags::default();
        flags.insert(Flag::Persistent);
        flags.insert(Flag::InTransit);
        flags.remove(Flag::Persistent);
        flags.remove(Flag::InTransit);
        assert_eq!(flags, Flags::default());
    }

    #[test]
    fn phase_follows_flags() {
        let mut flags = Flags::default();
        assert_eq!(Phase::of(&flags), Phase::Active);
        flags.insert(Flag::InTransit);
        assert_eq!(Phase::of(&flags), Phase::InTransit);
        flags.remove(Flag::InTransit);
        flags.insert(Flag::Ended);
        assert_eq!(Phase::of(&flags), Phase::Completing);
        flags.insert(Flag::Completed);
        assert_eq!(Phase::of(&flags), Phase::Complete);
    }
}

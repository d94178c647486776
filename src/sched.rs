//! Scheduling flag interlock (spec §4.7): a three-state flag mutated under
//! the task's lock, gating whether a scheduler thread may pick up the task.
//! At most one thread may hold `Active` at a time (invariant #3).

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedStatus {
    Inactive,
    Waiting,
    Active,
}

#[derive(Debug)]
pub struct SchedFlag(Mutex<SchedStatus>);

impl Default for SchedFlag {
    fn default() -> Self {
        Self(Mutex::new(SchedStatus::Inactive))
    }
}

impl SchedFlag {
    pub fn status(&self) -> SchedStatus {
        *self.0.lock().unwrap()
    }

    /// `Inactive -> Waiting`, returns whether the claim succeeded.
    pub fn set_wait(&self) -> bool {
        let mut s = self.0.lock().unwrap();
        if *s == SchedStatus::Inactive {
            *s = SchedStatus::Waiting;
            true
        } else {
            false
        }
    }

    /// `Waiting -> Active` if currently waiting; otherwise leaves state
    /// untouched. Returns the prior status either way.
    pub fn set_active(&self) -> SchedStatus {
        let mut s = self.0.lock().unwrap();
        let prior = *s;
        if prior == SchedStatus::Waiting {
            *s = SchedStatus::Active;
        }
        prior
    }

    /// Any state -> `Inactive`. Returns the prior status.
    pub fn set_inactive(&self) -> SchedStatus {
        let mut s = self.0.lock().unwrap();
        let prior = *s;
        debug_assert!(matches!(
            prior,
            SchedStatus::Waiting | SchedStatus::Active | SchedStatus::Inactive
        ));
        *s = SchedStatus::Inactive;
        prior
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn happy_path_handshake() {
        let flag = SchedFlag::default();
        assert!(flag.set_wait());
        assert_eq!(flag.set_active(), SchedStatus::Waiting);
        assert_eq!(flag.status(), SchedStatus::Active);
        assert_eq!(flag.set_inactive(), SchedStatus::Active);
        assert_eq!(flag.status(), SchedStatus::Inactive);
    }

    #[test]
    fn exactly_one_true_among_concurrent_claimants() {
        let flag = Arc::new(SchedFlag::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let flag = flag.clone();
                std::thread::spawn(move || flag.set_wait())
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|&&won| won).count(), 1);
        assert_eq!(flag.status(), SchedStatus::Waiting);
        assert_eq!(flag.set_inactive(), SchedStatus::Waiting);
    }
}
